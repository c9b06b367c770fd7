//! Publisher that delegates to an external program
//!
//! The request is written to the program's stdin as one JSON object. On
//! success the program exits 0 and prints a JSON receipt on stdout:
//!
//! ```json
//! {"external_media_id": "17912345678901234", "permalink": "https://instagram.com/p/abc"}
//! ```
//!
//! Any other exit status is a failed attempt; the first line of stderr becomes
//! the error message. Exit status 75 (`EX_TEMPFAIL`) is reported as a network
//! failure and 77 (`EX_NOPERM`) as an authentication failure.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{PublishReceipt, PublishRequest, Publisher};
use crate::error::PublishError;

const EX_TEMPFAIL: i32 = 75;
const EX_NOPERM: i32 = 77;

#[derive(Debug, Clone)]
pub struct CommandPublisher {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandPublisher {
    pub fn new(program: String, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program,
            args,
            timeout,
        }
    }

    async fn run(&self, input: Vec<u8>) -> Result<std::process::Output, PublishError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PublishError::Upstream(format!("failed to start {}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A program that ignores its input may close stdin early
            if let Err(e) = stdin.write_all(&input).await {
                tracing::debug!(program = %self.program, error = %e, "Publisher closed stdin early");
            }
        }

        child
            .wait_with_output()
            .await
            .map_err(|e| PublishError::Upstream(format!("{} did not finish: {}", self.program, e)))
    }
}

#[async_trait]
impl Publisher for CommandPublisher {
    fn name(&self) -> &str {
        "command"
    }

    async fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, PublishError> {
        let input = serde_json::to_vec(request)
            .map_err(|e| PublishError::Rejected(format!("unencodable request: {}", e)))?;

        let output = match tokio::time::timeout(self.timeout, self.run(input)).await {
            Ok(result) => result?,
            Err(_) => return Err(PublishError::Timeout(self.timeout.as_secs())),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr
                .lines()
                .find(|line| !line.trim().is_empty())
                .map(|line| line.trim().to_string())
                .unwrap_or_else(|| format!("{} exited with {}", self.program, output.status));

            return Err(match output.status.code() {
                Some(EX_TEMPFAIL) => PublishError::Network(message),
                Some(EX_NOPERM) => PublishError::Authentication(message),
                _ => PublishError::Upstream(message),
            });
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            PublishError::Upstream(format!("{} printed an unreadable receipt: {}", self.program, e))
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::types::{Account, ActionType, Post};

    fn request() -> PublishRequest {
        PublishRequest {
            account: Account {
                id: "acct-1".to_string(),
                owner_id: "owner".to_string(),
                username: "gallery".to_string(),
                is_active: true,
            },
            post: Post {
                id: "post-1".to_string(),
                account_id: "acct-1".to_string(),
                media_ref: "https://cdn.example/1.jpg".to_string(),
                caption: Some("hello".to_string()),
            },
            kind: ActionType::Story,
        }
    }

    fn sh(script: &str, timeout: Duration) -> CommandPublisher {
        CommandPublisher::new(
            "/bin/sh".to_string(),
            vec!["-c".to_string(), script.to_string()],
            timeout,
        )
    }

    #[tokio::test]
    async fn test_successful_receipt() {
        let publisher = sh(
            r#"cat > /dev/null; echo '{"external_media_id":"ig-1","permalink":"https://example.test/p/1"}'"#,
            Duration::from_secs(10),
        );

        let receipt = publisher.publish(&request()).await.unwrap();
        assert_eq!(receipt.external_media_id, "ig-1");
        assert_eq!(receipt.permalink.as_deref(), Some("https://example.test/p/1"));
    }

    #[tokio::test]
    async fn test_request_is_sent_on_stdin() {
        // Echo the kind field back as the media id
        let publisher = sh(
            r#"kind=$(cat | sed -n 's/.*"kind":"\([a-z]*\)".*/\1/p'); echo "{\"external_media_id\":\"$kind\",\"permalink\":null}""#,
            Duration::from_secs(10),
        );

        let receipt = publisher.publish(&request()).await.unwrap();
        assert_eq!(receipt.external_media_id, "story");
    }

    #[tokio::test]
    async fn test_exit_codes_map_to_errors() {
        let publisher = sh("cat > /dev/null; echo 'token expired' >&2; exit 77", Duration::from_secs(10));
        assert_eq!(
            publisher.publish(&request()).await,
            Err(PublishError::Authentication("token expired".to_string()))
        );

        let publisher = sh("cat > /dev/null; echo 'try later' >&2; exit 75", Duration::from_secs(10));
        assert_eq!(
            publisher.publish(&request()).await,
            Err(PublishError::Network("try later".to_string()))
        );

        let publisher = sh("cat > /dev/null; exit 1", Duration::from_secs(10));
        assert!(matches!(
            publisher.publish(&request()).await,
            Err(PublishError::Upstream(_))
        ));
    }

    #[tokio::test]
    async fn test_garbage_receipt_is_failure() {
        let publisher = sh("cat > /dev/null; echo not-json", Duration::from_secs(10));
        assert!(matches!(
            publisher.publish(&request()).await,
            Err(PublishError::Upstream(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout() {
        let publisher = sh("sleep 5", Duration::from_secs(1));
        assert_eq!(
            publisher.publish(&request()).await,
            Err(PublishError::Timeout(1))
        );
    }

    #[tokio::test]
    async fn test_missing_program() {
        let publisher = CommandPublisher::new(
            "/nonexistent/publish-media".to_string(),
            vec![],
            Duration::from_secs(1),
        );
        assert!(matches!(
            publisher.publish(&request()).await,
            Err(PublishError::Upstream(_))
        ));
    }
}
