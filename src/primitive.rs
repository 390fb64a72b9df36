//! Control words that bypass normal action execution.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{HarnessError, HarnessResult};

pub const DEFAULT_WAIT_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Primitive {
    Done,
    Fail,
    Wait,
    Ans,
    Timeout,
}

pub struct PrimitiveSpec {
    pub primitive: Primitive,
    pub name: &'static str,
    /// Prompt text; `«»` marks code and is rewritten per dialect. `None`
    /// means the model may not invoke it.
    pub usage: Option<&'static str>,
}

pub static PRIMITIVES: [PrimitiveSpec; 5] = [
    PrimitiveSpec {
        primitive: Primitive::Done,
        name: "DONE",
        usage: Some("When you think the task is done, return «DONE»"),
    },
    PrimitiveSpec {
        primitive: Primitive::Fail,
        name: "FAIL",
        usage: Some("When you think the task can not be done, return «FAIL». Don't easily say «FAIL»; try your best to do the task"),
    },
    PrimitiveSpec {
        primitive: Primitive::Wait,
        name: "WAIT",
        usage: Some("When you think you have to wait for some time, return «WAIT» or «WAIT n», in which n defaults to 5(s)"),
    },
    PrimitiveSpec {
        primitive: Primitive::Ans,
        name: "ANS",
        usage: Some("When you are asked to submit an answer, return «ANS s» without quotation marks surrounding s, and use «FAIL» if there is no answer to the question"),
    },
    PrimitiveSpec {
        primitive: Primitive::Timeout,
        name: "TIMEOUT",
        usage: None,
    },
];

impl Primitive {
    pub fn spec(&self) -> &'static PrimitiveSpec {
        match self {
            Self::Done => &PRIMITIVES[0],
            Self::Fail => &PRIMITIVES[1],
            Self::Wait => &PRIMITIVES[2],
            Self::Ans => &PRIMITIVES[3],
            Self::Timeout => &PRIMITIVES[4],
        }
    }

    pub fn name(&self) -> &'static str {
        self.spec().name
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Primitive {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PRIMITIVES
            .iter()
            .find(|p| p.name == s)
            .map(|p| p.primitive)
            .ok_or_else(|| HarnessError::Primitive(format!("unknown primitive: {s}")))
    }
}

/// Names the model is allowed to emit.
pub fn invocable() -> impl Iterator<Item = &'static PrimitiveSpec> {
    PRIMITIVES.iter().filter(|p| p.usage.is_some())
}

pub fn invocable_names() -> Vec<&'static str> {
    invocable().map(|p| p.name).collect()
}

/// Whether `code` starts with one of `names`.
pub fn is_primitive(code: &str, names: &[&str]) -> bool {
    let code = code.trim();
    names.iter().any(|n| code.starts_with(n))
}

/// How an episode ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "args", rename_all = "UPPERCASE")]
pub enum Termination {
    Done,
    Fail,
    #[serde(rename = "ANS")]
    Answer(String),
    Timeout,
}

impl Termination {
    pub fn primitive(&self) -> Primitive {
        match self {
            Self::Done => Primitive::Done,
            Self::Fail => Primitive::Fail,
            Self::Answer(_) => Primitive::Ans,
            Self::Timeout => Primitive::Timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Terminate(Termination),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Pause(Duration),
    Terminate(Termination),
}

impl Invocation {
    pub async fn run(self) -> StepOutcome {
        match self {
            Self::Pause(d) => {
                tracing::info!(secs = d.as_secs(), "WAIT primitive");
                tokio::time::sleep(d).await;
                StepOutcome::Continue
            }
            Self::Terminate(t) => StepOutcome::Terminate(t),
        }
    }
}

/// Resolves a primitive invocation such as `WAIT 3` or `ANS 42`.
pub fn interpret(code: &str) -> HarnessResult<Invocation> {
    let mut parts = code.trim().split(' ');
    let head = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();
    let primitive: Primitive = head.parse()?;

    let no_args = |p: Primitive| -> HarnessResult<()> {
        if args.is_empty() {
            Ok(())
        } else {
            Err(HarnessError::Primitive(format!("{p} takes no arguments, got {args:?}")))
        }
    };

    match primitive {
        Primitive::Done => {
            no_args(primitive)?;
            Ok(Invocation::Terminate(Termination::Done))
        }
        Primitive::Fail => {
            no_args(primitive)?;
            Ok(Invocation::Terminate(Termination::Fail))
        }
        Primitive::Wait => {
            let secs = match args.as_slice() {
                [] => DEFAULT_WAIT_SECS,
                [n] => n
                    .parse::<u64>()
                    .map_err(|e| HarnessError::Primitive(format!("bad WAIT span '{n}': {e}")))?,
                more => {
                    return Err(HarnessError::Primitive(format!(
                        "WAIT takes one argument, got {more:?}"
                    )))
                }
            };
            Ok(Invocation::Pause(Duration::from_secs(secs)))
        }
        Primitive::Ans => Ok(Invocation::Terminate(Termination::Answer(args.join(" ")))),
        Primitive::Timeout => Err(HarnessError::Primitive("TIMEOUT is not invocable".into())),
    }
}
