//! Control-script sandbox.
//!
//! User code is a line-oriented control script interpreted against the
//! [`SimFacade`] — the script's only ambient capability. Grammar:
//!
//! ```text
//! reset                 # reset the simulation
//! step 0.5              # one physics step, actuator command [0.5]
//! repeat 5 step 0       # run a command N times
//! state                 # print the physics state as JSON
//! echo starting run     # print literal text
//! sleep 250             # wait N milliseconds
//! ```
//!
//! `#` starts a comment; blank lines are skipped. Stdout and stderr are
//! captured into the [`ExecOutcome`]; script failures never tear down the
//! session. The wall-clock cap is enforced by the caller.

use serde::{Deserialize, Serialize};

use crate::facade::SimFacade;

/// Maximum repeat count; a runaway loop should hit this, not the wall clock.
const MAX_REPEAT: u64 = 10_000;

/// Final status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Success,
    Error,
}

/// Result of one user-code execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub status: ExecStatus,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Unix milliseconds.
    pub finished_at: u64,
}

impl ExecOutcome {
    pub fn timeout() -> Self {
        Self {
            status: ExecStatus::Error,
            stdout: String::new(),
            stderr: "execution exceeded the wall-clock cap".to_string(),
            error: Some("timeout".to_string()),
            finished_at: now_ms(),
        }
    }
}

/// One parsed script operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptOp {
    Reset,
    Step(Vec<f64>),
    Repeat(u64, Box<ScriptOp>),
    State,
    Echo(String),
    Sleep(u64),
}

/// Parse failure with its 1-based line number.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptError {
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ScriptError {}

/// Parse a whole script. Empty input parses to an empty program.
pub fn parse(code: &str) -> Result<Vec<ScriptOp>, ScriptError> {
    let mut ops = Vec::new();
    for (idx, raw) in code.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        ops.push(parse_line(line, idx + 1)?);
    }
    Ok(ops)
}

fn parse_line(line: &str, line_no: usize) -> Result<ScriptOp, ScriptError> {
    let err = |message: String| ScriptError {
        line: line_no,
        message,
    };
    let mut parts = line.split_whitespace();
    let verb = parts.next().unwrap_or_default();
    match verb {
        "reset" => Ok(ScriptOp::Reset),
        "state" => Ok(ScriptOp::State),
        "step" => {
            let action = parts
                .map(|p| {
                    p.parse::<f64>()
                        .map_err(|_| err(format!("step expects numbers, got {p:?}")))
                })
                .collect::<Result<Vec<f64>, _>>()?;
            Ok(ScriptOp::Step(action))
        }
        "echo" => {
            let text = line.strip_prefix("echo").unwrap_or_default().trim();
            Ok(ScriptOp::Echo(text.to_string()))
        }
        "sleep" => {
            let ms: u64 = parts
                .next()
                .ok_or_else(|| err("sleep expects milliseconds".to_string()))?
                .parse()
                .map_err(|_| err("sleep expects milliseconds".to_string()))?;
            Ok(ScriptOp::Sleep(ms))
        }
        "repeat" => {
            let count: u64 = parts
                .next()
                .ok_or_else(|| err("repeat expects a count".to_string()))?
                .parse()
                .map_err(|_| err("repeat expects a count".to_string()))?;
            if count > MAX_REPEAT {
                return Err(err(format!("repeat count exceeds the cap of {MAX_REPEAT}")));
            }
            let rest: Vec<&str> = parts.collect();
            if rest.is_empty() {
                return Err(err("repeat expects a command".to_string()));
            }
            let inner = parse_line(&rest.join(" "), line_no)?;
            if matches!(inner, ScriptOp::Repeat(..)) {
                return Err(err("repeat cannot be nested".to_string()));
            }
            Ok(ScriptOp::Repeat(count, Box::new(inner)))
        }
        other => Err(err(format!("unknown command: {other:?}"))),
    }
}

/// Interpret a script against the façade and capture its output.
///
/// Always returns an outcome; the session is never torn down by user code.
pub async fn run(code: &str, facade: &SimFacade) -> ExecOutcome {
    let ops = match parse(code) {
        Ok(ops) => ops,
        Err(e) => {
            return ExecOutcome {
                status: ExecStatus::Error,
                stdout: String::new(),
                stderr: e.to_string(),
                error: Some(e.to_string()),
                finished_at: now_ms(),
            }
        }
    };

    let mut stdout = String::new();
    for op in &ops {
        if let Err(e) = run_op(op, facade, &mut stdout).await {
            return ExecOutcome {
                status: ExecStatus::Error,
                stdout,
                stderr: e.clone(),
                error: Some(e),
                finished_at: now_ms(),
            };
        }
    }

    ExecOutcome {
        status: ExecStatus::Success,
        stdout,
        stderr: String::new(),
        error: None,
        finished_at: now_ms(),
    }
}

async fn run_op(op: &ScriptOp, facade: &SimFacade, stdout: &mut String) -> Result<(), String> {
    match op {
        ScriptOp::Reset => {
            facade.reset().await.map_err(|e| e.to_string())?;
        }
        ScriptOp::Step(action) => {
            facade.step(action.clone()).await.map_err(|e| e.to_string())?;
        }
        ScriptOp::State => {
            let state = facade.state().await.map_err(|e| e.to_string())?;
            stdout.push_str(&serde_json::to_string(&state).unwrap_or_default());
            stdout.push('\n');
        }
        ScriptOp::Echo(text) => {
            stdout.push_str(text);
            stdout.push('\n');
        }
        ScriptOp::Sleep(ms) => {
            tokio::time::sleep(std::time::Duration::from_millis(*ms)).await;
        }
        ScriptOp::Repeat(count, inner) => {
            for _ in 0..*count {
                Box::pin(run_op(inner, facade, stdout)).await?;
            }
        }
    }
    Ok(())
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_program() {
        assert!(parse("").unwrap().is_empty());
        assert!(parse("\n  \n# only a comment\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_basic_commands() {
        let ops = parse("reset\nstep 0.5 -1\nstate\necho hi there\nsleep 10").unwrap();
        assert_eq!(
            ops,
            vec![
                ScriptOp::Reset,
                ScriptOp::Step(vec![0.5, -1.0]),
                ScriptOp::State,
                ScriptOp::Echo("hi there".to_string()),
                ScriptOp::Sleep(10),
            ]
        );
    }

    #[test]
    fn test_parse_step_without_action_is_zero_command() {
        assert_eq!(parse("step").unwrap(), vec![ScriptOp::Step(vec![])]);
    }

    #[test]
    fn test_parse_repeat() {
        let ops = parse("repeat 5 step 0").unwrap();
        assert_eq!(
            ops,
            vec![ScriptOp::Repeat(5, Box::new(ScriptOp::Step(vec![0.0])))]
        );
    }

    #[test]
    fn test_parse_rejects_nested_repeat_and_huge_counts() {
        assert!(parse("repeat 2 repeat 2 step").is_err());
        assert!(parse(&format!("repeat {} step", MAX_REPEAT + 1)).is_err());
    }

    #[test]
    fn test_parse_error_carries_line_number() {
        let err = parse("reset\nfly away").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("fly"));
    }

    #[test]
    fn test_parse_inline_comment() {
        let ops = parse("step 1 # push right").unwrap();
        assert_eq!(ops, vec![ScriptOp::Step(vec![1.0])]);
    }

    #[tokio::test]
    async fn test_run_empty_code_succeeds_with_empty_stdout() {
        // A facade whose loop is gone would fail any call, but empty code
        // makes none.
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let facade = SimFacade::new(tx);
        let outcome = run("", &facade).await;
        assert_eq!(outcome.status, ExecStatus::Success);
        assert!(outcome.stdout.is_empty());
        assert!(outcome.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_run_parse_failure_reports_error() {
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let facade = SimFacade::new(tx);
        let outcome = run("launch missiles", &facade).await;
        assert_eq!(outcome.status, ExecStatus::Error);
        assert!(outcome.error.as_deref().unwrap().contains("line 1"));
    }

    #[tokio::test]
    async fn test_run_echo_only_captures_stdout() {
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let facade = SimFacade::new(tx);
        let outcome = run("echo one\necho two", &facade).await;
        assert_eq!(outcome.status, ExecStatus::Success);
        assert_eq!(outcome.stdout, "one\ntwo\n");
    }
}
