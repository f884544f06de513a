use std::{
    process::{Output, Stdio},
    time::Duration,
};

use tokio::{io::AsyncWriteExt, process::Command};

use crate::backend::BackendError;

/// Run `program` and wait until it exits, or until `timeout` expires.
///
/// If `input` is given, it is written to the standard input of the
/// process. The process is killed if the timeout expires.
pub(crate) async fn run(
    program: &str,
    args: &[&str],
    input: Option<&str>,
    timeout: Duration,
) -> Result<Output, BackendError> {
    tracing::debug!(program, ?args, "running command");

    let mut child = Command::new(program)
        .args(args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BackendError::Io(e, program.into()))?;

    if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
        stdin
            .write_all(input.as_bytes())
            .await
            .map_err(|e| BackendError::Io(e, program.into()))?;
    }

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output.map_err(|e| BackendError::Io(e, program.into())),
        Err(_) => Err(BackendError::Timeout(program.to_owned(), timeout)),
    }
}

/// Run `program`, and return its standard output if it exits
/// successfully.
pub(crate) async fn run_checked(
    program: &str,
    args: &[&str],
    input: Option<&str>,
    timeout: Duration,
) -> Result<String, BackendError> {
    let output = run(program, args, input, timeout).await?;

    if !output.status.success() {
        return Err(BackendError::Command {
            command: format!("{program} {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(all(test, unix))]
#[tokio::test]
async fn command_timeout() {
    let err = run("sleep", &["5"], None, Duration::from_millis(100))
        .await
        .unwrap_err();

    assert!(matches!(err, BackendError::Timeout(..)), "{err:?}");

    let stdout = run_checked("cat", &[], Some("registry.local"), Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(stdout, "registry.local");
}
