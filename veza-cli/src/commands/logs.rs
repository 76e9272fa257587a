//! `vezactl logs | shell`

use super::Options;
use anyhow::Result;

/// Print (or follow) a service's unit journal.
pub async fn logs(options: &Options, service: &str, lines: usize, follow: bool) -> Result<i32> {
    let deployment = options.open().await?;

    if follow {
        let code = deployment.follow_logs(service, lines).await?;
        return Ok(code);
    }

    let output = deployment.logs(service, lines).await?;
    print!("{}", output);
    Ok(0)
}

/// Open an interactive shell in a service's container.
pub async fn shell(options: &Options, service: &str) -> Result<i32> {
    let deployment = options.open().await?;
    let code = deployment.shell(service).await?;
    Ok(code)
}
