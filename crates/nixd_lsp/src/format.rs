//! External formatter subprocess.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Hard deadline for the external command. On expiry the request fails
/// but the child is left to finish in the background.
pub const FORMAT_TIMEOUT: Duration = Duration::from_secs(1);

/// Pipe `input` through `command` and return its stdout.
pub async fn run_formatter(command: &str, input: &str) -> Result<String> {
    let program =
        which::which(command).with_context(|| format!("formatter '{command}' not found"))?;
    let mut child = Command::new(program)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("spawning formatter '{command}'"))?;

    let mut stdin = child.stdin.take().context("formatter has no stdin pipe")?;
    stdin
        .write_all(input.as_bytes())
        .await
        .context("piping draft to formatter")?;
    drop(stdin);

    let output = match tokio::time::timeout(FORMAT_TIMEOUT, child.wait_with_output()).await {
        Ok(result) => result.context("collecting formatter output")?,
        Err(_) => bail!("formatter did not reply within {FORMAT_TIMEOUT:?}"),
    };
    if !output.status.success() {
        bail!("formatter exited with {}", output.status);
    }
    String::from_utf8(output.stdout).context("formatter produced invalid utf-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pipes_the_document_through_the_command() {
        let formatted = run_formatter("cat", "{ a = 1; }\n").await.unwrap();
        assert_eq!(formatted, "{ a = 1; }\n");
    }

    #[tokio::test]
    async fn unknown_command_is_an_error() {
        let result = run_formatter("definitely-not-a-formatter-1234", "x").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn failing_command_is_an_error() {
        let result = run_formatter("false", "x").await;
        assert!(result.is_err());
    }
}
