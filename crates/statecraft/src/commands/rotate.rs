use colored::Colorize;
use statecraft_core::{Scope, rotate_password};

pub async fn handle(root: &Scope, old_password: &str, new_password_env: &str) -> anyhow::Result<()> {
    let new_password = std::env::var(new_password_env).map_err(|_| {
        anyhow::anyhow!("環境変数 {} が設定されていません", new_password_env)
    })?;
    if new_password.is_empty() {
        anyhow::bail!("新しいパスワードが空です");
    }
    if new_password == old_password {
        anyhow::bail!("新しいパスワードが現在のパスワードと同じです");
    }

    println!(
        "{} {}",
        "パスワードをローテーション中:".blue(),
        root.stage().cyan()
    );

    let report = rotate_password(root, old_password, &new_password).await?;

    println!(
        "{} {} 件を再暗号化 ({} 件はシークレットなし、{} スコープ)",
        "✓".green(),
        report.rotated,
        report.skipped,
        report.scopes
    );
    println!(
        "{}",
        format!(
            "以降は {} に新しいパスワードを設定してください",
            statecraft_config::PASSWORD_ENV
        )
        .dimmed()
    );
    Ok(())
}
