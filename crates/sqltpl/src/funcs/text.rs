use serde_json::Value;

/// Lower-case hex MD5 digest of the concatenation of `parts`.
pub fn md5_lower(parts: &[&str]) -> String {
    format!("{:x}", md5::compute(parts.concat()))
}

/// Map integer cents (fen) into a decimal yuan string with two places.
/// Integer strings are accepted. Other strings are passed through unchanged,
/// and any other value maps to "".
pub fn fen2yuan(fen: &Value) -> String {
    match fen {
        Value::Number(n) => match (n.as_i64(), n.as_u64()) {
            (Some(i), _) => yuan(i < 0, i.unsigned_abs()),
            (None, Some(u)) => yuan(false, u),
            _ => String::new(),
        },
        Value::String(s) => match s.parse::<i64>() {
            Ok(i) => yuan(i < 0, i.unsigned_abs()),
            Err(_) => s.clone(),
        },
        _ => String::new(),
    }
}

fn yuan(negative: bool, fen: u64) -> String {
    let sign = if negative { "-" } else { "" };
    format!("{sign}{}.{:02}", fen / 100, fen % 100)
}

/// Seconds since the Unix epoch.
pub fn timestamp_second() -> i64 {
    chrono::Utc::now().timestamp()
}

/// An opaque, globally unique identifier.
pub fn xid() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// "user_name" => "UserName".
pub fn to_camel(s: &str) -> String {
    words(s).iter().map(|w| capitalize(w)).collect()
}

/// "user_name" => "userName".
pub fn to_lower_camel(s: &str) -> String {
    words(s)
        .iter()
        .enumerate()
        .map(|(i, w)| if i == 0 { w.to_lowercase() } else { capitalize(w) })
        .collect()
}

/// "UserName" => "user_name".
pub fn snake_case(s: &str) -> String {
    words(s)
        .iter()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join("_")
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

// Split `s` into words at non-alphanumerics, lower-to-upper transitions,
// and the final capital of an acronym ("HTTPServer" => "HTTP", "Server").
fn words(s: &str) -> Vec<String> {
    let chars: Vec<char> = s.chars().collect();
    let mut words = Vec::new();
    let mut current = String::new();

    for (i, &c) in chars.iter().enumerate() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            continue;
        }
        if c.is_uppercase() && !current.is_empty() {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).map_or(false, |n| n.is_lowercase());

            if prev.is_lowercase() || prev.is_numeric() || (prev.is_uppercase() && next_lower) {
                words.push(std::mem::take(&mut current));
            }
        }
        current.push(c);
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}
