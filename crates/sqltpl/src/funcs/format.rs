use serde_json::Value;

/// Conditionally include a SQL fragment.
///
/// Returns "" if `value` is empty (null, false, zero, or an empty string,
/// array, or object). Otherwise, if `format` has a live `%` verb it's
/// formatted with `value` as its operand, and if it doesn't (it has none,
/// or only escaped `%%`) `format` is returned unchanged. The latter lets a
/// fragment carry its own `:name` placeholder:
///
/// ```
/// use serde_json::json;
/// use sqltpl::funcs::no_empty;
///
/// assert_eq!(no_empty("and id=%d", &json!(0)), "");
/// assert_eq!(no_empty("and id=%d", &json!(1)), "and id=1");
/// assert_eq!(no_empty("and name =:Name", &json!("test")), "and name =:Name");
/// assert_eq!(no_empty("and name like %%%s%%", &json!("test")), "and name like %test%");
/// ```
pub fn no_empty(format: &str, value: &Value) -> String {
    if is_blank(value) {
        String::new()
    } else if has_verb(format) {
        sprintf(format, value)
    } else {
        format.to_string()
    }
}

pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

// A verb is live if it follows an odd run of '%'.
fn has_verb(format: &str) -> bool {
    let mut armed = false;
    for c in format.chars() {
        if c == '%' {
            armed = !armed;
        } else if armed {
            return true;
        }
    }
    false
}

#[derive(Default)]
struct Spec {
    minus: bool,
    plus: bool,
    zero: bool,
    width: Option<usize>,
    precision: Option<usize>,
}

/// Format `operand` into `format`, following the conventions of Go's fmt
/// for a single operand: `%d %s %v %f %t %q %x` with flags `-+0`, width
/// and precision. A verb that doesn't fit its operand renders as
/// `%!verb(type=value)`, and verbs beyond the first render as `%!verb(MISSING)`.
pub fn sprintf(format: &str, operand: &Value) -> String {
    let mut out = String::with_capacity(format.len() + 8);
    let mut chars = format.chars().peekable();
    let mut used = false;

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut spec = Spec::default();

        while let Some(&flag) = chars.peek() {
            match flag {
                '-' => spec.minus = true,
                '+' => spec.plus = true,
                '0' => spec.zero = true,
                ' ' | '#' => (),
                _ => break,
            }
            chars.next();
        }
        spec.width = take_number(&mut chars);
        if chars.peek() == Some(&'.') {
            chars.next();
            spec.precision = Some(take_number(&mut chars).unwrap_or(0));
        }

        let Some(verb) = chars.next() else {
            out.push_str("%!(NOVERB)");
            break;
        };
        if verb == '%' {
            out.push('%');
            continue;
        }
        if used {
            out.push_str(&format!("%!{verb}(MISSING)"));
            continue;
        }
        used = true;

        let (body, numeric) = match format_verb(verb, &spec, operand) {
            Some(body) => body,
            None => (bad_verb(verb, operand), false),
        };
        out.push_str(&pad(body, &spec, numeric));
    }
    out
}

fn take_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<usize> {
    let mut n: Option<usize> = None;
    while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
        n = Some(n.unwrap_or(0) * 10 + d as usize);
        chars.next();
    }
    n
}

// Returns the formatted operand and whether it's numeric (for zero padding),
// or None if `verb` doesn't apply to `operand`.
fn format_verb(verb: char, spec: &Spec, operand: &Value) -> Option<(String, bool)> {
    let signed = |s: String| {
        if spec.plus && !s.starts_with('-') {
            format!("+{s}")
        } else {
            s
        }
    };

    match (verb, operand) {
        ('v', Value::String(s)) => Some((s.clone(), false)),
        ('v', Value::Number(n)) => Some((signed(n.to_string()), true)),
        ('v', Value::Null) => Some(("<nil>".to_string(), false)),
        ('v', other) => Some((other.to_string(), false)),

        ('s', Value::String(s)) => Some((
            match spec.precision {
                Some(p) => s.chars().take(p).collect(),
                None => s.clone(),
            },
            false,
        )),

        ('d', Value::Number(n)) if !n.is_f64() => Some((signed(n.to_string()), true)),

        ('f' | 'F', Value::Number(n)) if n.is_f64() => {
            let f = n.as_f64()?;
            let p = spec.precision.unwrap_or(6);
            Some((signed(format!("{f:.p$}")), true))
        }

        ('t', Value::Bool(b)) => Some((b.to_string(), false)),

        ('q', Value::String(s)) => Some((format!("{s:?}"), false)),

        ('x', Value::Number(n)) => {
            if let Some(i) = n.as_u64() {
                Some((format!("{i:x}"), true))
            } else {
                n.as_i64().map(|i| (format!("-{:x}", i.unsigned_abs()), true))
            }
        }
        ('x', Value::String(s)) => Some((
            s.bytes().map(|b| format!("{b:02x}")).collect(),
            false,
        )),

        _ => None,
    }
}

fn bad_verb(verb: char, operand: &Value) -> String {
    let type_name = match operand {
        Value::Null => return format!("%!{verb}(<nil>)"),
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float64",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    let display = match operand {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    format!("%!{verb}({type_name}={display})")
}

fn pad(body: String, spec: &Spec, numeric: bool) -> String {
    let Some(width) = spec.width else {
        return body;
    };
    let len = body.chars().count();
    if len >= width {
        return body;
    }
    let fill = width - len;

    if spec.minus {
        format!("{body}{}", " ".repeat(fill))
    } else if spec.zero && numeric {
        let (sign, digits) = match body.chars().next() {
            Some(c @ ('-' | '+')) => (c.to_string(), &body[1..]),
            _ => (String::new(), body.as_str()),
        };
        format!("{sign}{}{digits}", "0".repeat(fill))
    } else {
        format!("{}{body}", " ".repeat(fill))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_no_empty() {
        let cases = [
            ("and id=%d", json!(0), ""),
            ("and id=%d", json!(0.0), ""),
            ("and id=%d", json!(""), ""),
            ("and id=%d", json!(null), ""),
            ("and id=%d", json!(false), ""),
            ("and id=%d", json!([]), ""),
            ("and id=%d", json!(1), "and id=1"),
            ("and name like %%%s%%", json!("test"), "and name like %test%"),
            ("and name =:Name", json!("test"), "and name =:Name"),
            ("and name =:Name%%", json!("test"), "and name =:Name%%"),
            ("and name =:Name%%s", json!("test"), "and name =:Name%%s"),
            ("and name =:Name%", json!("test"), "and name =:Name%"),
        ];
        for (format, value, expect) in cases {
            assert_eq!(no_empty(format, &value), expect, "{format} {value}");
        }
    }

    #[test]
    fn test_sprintf_verbs() {
        let cases = [
            ("%v", json!("x"), "x"),
            ("%v", json!(1.5), "1.5"),
            ("%v", json!([1, 2]), "[1,2]"),
            ("id=%05d", json!(-42), "id=-0042"),
            ("[%-4d]", json!(7), "[7   ]"),
            ("%+d", json!(3), "+3"),
            ("%.2f", json!(3.14159), "3.14"),
            ("%f", json!(0.5), "0.500000"),
            ("%.3s", json!("abcdef"), "abc"),
            ("%5s|", json!("ab"), "   ab|"),
            ("%t", json!(true), "true"),
            ("%q", json!("a\"b"), "\"a\\\"b\""),
            ("%x", json!(255), "ff"),
            ("%x", json!("hi"), "6869"),
        ];
        for (format, value, expect) in cases {
            assert_eq!(sprintf(format, &value), expect, "{format} {value}");
        }
    }

    #[test]
    fn test_sprintf_mismatches() {
        insta::assert_snapshot!(sprintf("id=%d", &json!("test")), @"id=%!d(string=test)");
        insta::assert_snapshot!(sprintf("%s", &json!(1)), @"%!s(int=1)");
        insta::assert_snapshot!(sprintf("%d", &json!(1.5)), @"%!d(float64=1.5)");
        insta::assert_snapshot!(sprintf("%d and %d", &json!(1)), @"1 and %!d(MISSING)");
        insta::assert_snapshot!(sprintf("trailing %", &json!(1)), @"trailing %!(NOVERB)");
    }
}
