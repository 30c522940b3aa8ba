use anyhow::Context;
use clap::Parser;
use sqltpl::{executor, CallContext, DbConfig, Dialect, Registry, TemplateSet, Volume};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

#[derive(Debug, clap::Parser)]
#[clap(author, name = "sqltpl", version)]
pub struct Args {
    #[clap(subcommand)]
    pub subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
pub enum Subcommand {
    /// Render a template against a JSON volume read from stdin, and print its SQL.
    Render(RenderArgs),
    /// Render a template against a JSON volume read from stdin, execute it,
    /// and print its result as JSON.
    Exec(ExecArgs),
}

#[derive(Debug, clap::Args)]
#[clap(rename_all = "kebab-case")]
pub struct TemplateArgs {
    /// Template file, or directory of template files.
    #[clap(long)]
    templates: PathBuf,
    /// Suffix of template files within a --templates directory.
    #[clap(long, default_value = ".tpl")]
    suffix: String,
    /// Name of the template to render.
    #[clap(long)]
    name: String,
}

#[derive(Debug, clap::Args)]
pub struct RenderArgs {
    #[clap(flatten)]
    template: TemplateArgs,
    /// Dialect of rendered SQL literals.
    #[clap(long, value_enum, default_value_t = Dialect::MySql)]
    dialect: Dialect,
}

#[derive(Debug, clap::Args)]
pub struct ExecArgs {
    #[clap(flatten)]
    template: TemplateArgs,
    #[clap(flatten)]
    db: DbConfig,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct RenderOutput {
    named_sql: String,
    sql: String,
}

const ID: &str = "cli";

impl TemplateArgs {
    fn load(&self) -> anyhow::Result<TemplateSet> {
        let mut set = TemplateSet::new();

        if self.templates.is_dir() {
            set.add_from_dir(&self.templates, &self.suffix)?;
        } else {
            let source = std::fs::read_to_string(&self.templates)
                .with_context(|| format!("reading {}", self.templates.display()))?;
            set.add_from_str(&template_name(&self.templates, &self.suffix), &source)?;
        }
        Ok(set)
    }
}

fn template_name(path: &Path, suffix: &str) -> String {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    match file_name.strip_suffix(suffix) {
        Some(name) => name.to_string(),
        None => file_name,
    }
}

fn read_volume() -> anyhow::Result<Volume> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("reading volume from stdin")?;

    if input.trim().is_empty() {
        return Ok(Volume::new());
    }
    let value: serde_json::Value =
        serde_json::from_str(&input).context("parsing volume from stdin")?;
    Ok(Volume::from_serialize(&value)?)
}

impl Subcommand {
    async fn run(&self) -> anyhow::Result<()> {
        match self {
            Subcommand::Render(args) => {
                let registry = Registry::new(args.dialect);
                registry.register(ID, args.template.load()?, None);

                let out = registry.get_sql(ID, &args.template.name, read_volume()?)?;
                let out = RenderOutput {
                    named_sql: out.named_sql,
                    sql: out.sql,
                };
                println!("{}", serde_json::to_string_pretty(&out)?);
            }
            Subcommand::Exec(args) => {
                let registry = Registry::new(args.db.dialect()?);
                registry.register_executor(ID, executor::connect(&args.db)?);
                registry.register(
                    ID,
                    Arc::new(args.template.load()?),
                    Some(registry.executor_factory(ID)),
                );

                let out: serde_json::Value = registry
                    .exec_sql_tpl(&CallContext::new(), ID, &args.template.name, read_volume()?)
                    .await?;
                println!("{}", serde_json::to_string_pretty(&out)?);
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("setting tracing default")?;

    let args = Args::parse();

    args.subcommand.run().await
}
