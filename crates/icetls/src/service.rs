use std::process::Command;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct RestartOutcome {
    pub ok: bool,
    pub detail: String,
}

// Run the configured restart command and report the result. A failing
// restart never fails the deploy: the saved configuration stands either way,
// and the caller decides how loudly to report it.
pub fn restart_service(command: &[String]) -> Result<RestartOutcome> {
    let (prog, args) = command
        .split_first()
        .ok_or_else(|| Error::msg("restart command is empty"))?;
    match Command::new(prog).args(args).output() {
        Ok(out) if out.status.success() => Ok(RestartOutcome {
            ok: true,
            detail: format!("{} exited successfully", command.join(" ")),
        }),
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let stderr = stderr.trim();
            Ok(RestartOutcome {
                ok: false,
                detail: if stderr.is_empty() {
                    format!("{} exited with {}", command.join(" "), out.status)
                } else {
                    format!("{} failed: {stderr}", command.join(" "))
                },
            })
        }
        Err(e) => Ok(RestartOutcome {
            ok: false,
            detail: format!("failed to run {prog}: {e}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_command_reports_ok() {
        let out = restart_service(&["true".to_string()]).expect("run");
        assert!(out.ok);
    }

    #[test]
    fn failing_command_reports_detail_without_erroring() {
        let out = restart_service(&["false".to_string()]).expect("run");
        assert!(!out.ok);
        assert!(!out.detail.is_empty());
    }

    #[test]
    fn missing_binary_reports_detail_without_erroring() {
        let out =
            restart_service(&["definitely-not-a-real-binary-3f9a".to_string()]).expect("run");
        assert!(!out.ok);
    }

    #[test]
    fn empty_command_is_an_error() {
        assert!(restart_service(&[]).is_err());
    }
}
