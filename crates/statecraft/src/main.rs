mod backend;
mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use statecraft_config::EngineConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "statecraft")]
#[command(about = "インフラのステートを、確かめて、守る。", long_about = None)]
struct Cli {
    /// ステージ名 (STATECRAFT_STAGE 環境変数、statecraft.yaml より優先)
    #[arg(short = 's', long = "stage", global = true)]
    stage: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// スコープ内のリソース一覧を表示
    List {
        /// 対象スコープ (例: api/workers)。省略時はステージ直下
        #[arg(long)]
        scope: Option<String>,
    },
    /// リソースのステートを表示（シークレットはマスク）
    Show {
        /// リソースID
        id: String,
        /// 対象スコープ (例: api/workers)
        #[arg(long)]
        scope: Option<String>,
    },
    /// シークレット暗号化パスワードを変更
    ///
    /// 現在のパスワードは STATECRAFT_PASSWORD から読み込む
    #[command(name = "rotate-password")]
    RotatePassword {
        /// 新しいパスワードを格納した環境変数名
        #[arg(long)]
        new_password_env: String,
    },
    /// バージョン情報を表示
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    // Versionコマンドは設定ファイル不要
    if matches!(cli.command, Commands::Version) {
        println!("statecraft {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut config = EngineConfig::load()?;
    if let Some(stage) = cli.stage {
        config.stage = stage;
    }

    let factory = backend::build(&config.store)?;
    let root = backend::root_scope(&config, factory);

    match cli.command {
        Commands::List { scope } => {
            commands::list::handle(&root, scope.as_deref()).await?;
        }
        Commands::Show { id, scope } => {
            commands::show::handle(&root, scope.as_deref(), &id).await?;
        }
        Commands::RotatePassword { new_password_env } => {
            let old_password = config.password.as_deref().ok_or_else(|| {
                anyhow::anyhow!(
                    "現在のパスワードが設定されていません。{} を設定してください",
                    statecraft_config::PASSWORD_ENV
                )
            })?;
            commands::rotate::handle(&root, old_password, &new_password_env).await?;
        }
        Commands::Version => unreachable!(),
    }

    Ok(())
}

/// ステージ・スコープ見出しを表示
fn print_scope_header(chain: &[String]) {
    println!("{} {}", "スコープ:".blue(), chain.join("/").cyan());
}
