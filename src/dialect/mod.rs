//! Output dialects and the extraction dispatcher.
//!
//! Each model family speaks one dialect. The configured dialect is resolved
//! once from its name; extraction turns a model response into [`CodeBlock`]s
//! for the executor.

mod extractors;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::action::{CompileOptions, CoordinateSpace, InputMode, OperationGroup, ParseProfile};
use crate::errors::{GrammarError, HarnessError, HarnessResult};
use crate::llm::types::ModelResponse;
use crate::perception::marks::{tag_legend, Tag};
use crate::perception::resize::{smart_resize_bounds, PixelBudget};
use crate::primitive;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Dialect {
    /// Fenced code blocks holding `pyautogui` code or primitives.
    Antiquot,
    /// Natural-language plans; only fenced primitives are executable.
    Planner,
    /// `CLICK <point>[[x, y]]</point>`, `TYPE [..]`, `SCROLL [..]`.
    Atlas,
    /// Bare `(x, y)` click points.
    UGround,
    /// Thought/Action, boxes in thousandths.
    UiTars,
    /// Thought/Action, boxes in resized-screenshot pixels.
    UiTars15,
}

type ExtractFn = fn(&str, &ExtractContext) -> Result<Vec<CodeBlock>, GrammarError>;

pub struct DialectEntry {
    pub dialect: Dialect,
    pub name: &'static str,
    extract: ExtractFn,
    /// Space compiled points are emitted in.
    pub space: CoordinateSpace,
    /// Rewrites `«code»` markers in primitive usage docs.
    wrap_doc: fn(&str) -> String,
}

fn wrap_fenced(doc: &str) -> String {
    doc.replace('«', "```").replace('»', "```")
}

fn wrap_plain(doc: &str) -> String {
    doc.to_string()
}

pub static DIALECTS: [DialectEntry; 6] = [
    DialectEntry {
        dialect: Dialect::Antiquot,
        name: "antiquot",
        extract: extractors::antiquot,
        space: CoordinateSpace::Normalized,
        wrap_doc: wrap_fenced,
    },
    DialectEntry {
        dialect: Dialect::Planner,
        name: "planner",
        extract: extractors::planner,
        space: CoordinateSpace::Normalized,
        wrap_doc: wrap_fenced,
    },
    DialectEntry {
        dialect: Dialect::Atlas,
        name: "atlas",
        extract: extractors::atlas,
        space: CoordinateSpace::Normalized,
        wrap_doc: wrap_plain,
    },
    DialectEntry {
        dialect: Dialect::UGround,
        name: "uground",
        extract: extractors::uground,
        space: CoordinateSpace::Normalized,
        wrap_doc: wrap_plain,
    },
    DialectEntry {
        dialect: Dialect::UiTars,
        name: "uitars",
        extract: extractors::uitars,
        space: CoordinateSpace::Normalized,
        wrap_doc: wrap_plain,
    },
    DialectEntry {
        dialect: Dialect::UiTars15,
        name: "uitars1_5",
        extract: extractors::uitars15,
        space: CoordinateSpace::Pixel,
        wrap_doc: wrap_plain,
    },
];

impl Dialect {
    pub fn entry(&self) -> &'static DialectEntry {
        // DIALECTS is in declaration order
        &DIALECTS[*self as usize]
    }

    pub fn name(&self) -> &'static str {
        self.entry().name
    }

    pub fn coordinate_space(&self) -> CoordinateSpace {
        self.entry().space
    }

    /// Compile options for a screen of the given size.
    pub fn compile_options(&self, screen_width: u32, screen_height: u32, input_mode: InputMode) -> CompileOptions {
        CompileOptions {
            screen_width,
            screen_height,
            input_mode,
            space: self.coordinate_space(),
        }
    }

    /// Grounding dialects turn a plan into actions for the planner dialect.
    pub fn is_grounding(&self) -> bool {
        matches!(self, Self::Atlas | Self::UGround)
    }

    pub fn wrap_doc(&self, doc: &str) -> String {
        (self.entry().wrap_doc)(doc)
    }

    /// Parse rules for the Thought/Action dialects.
    pub fn parse_profile(&self, screen_width: u32, screen_height: u32) -> Option<ParseProfile> {
        match self {
            Self::UiTars => Some(ParseProfile::uitars()),
            Self::UiTars15 => {
                let (h, w) = smart_resize_bounds(screen_height, screen_width, &PixelBudget::default())
                    .unwrap_or((screen_height, screen_width));
                Some(ParseProfile::uitars15(h, w))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Dialect {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DIALECTS
            .iter()
            .find(|e| e.name == s)
            .map(|e| e.dialect)
            .ok_or_else(|| HarnessError::Config(format!("unknown code style: {s}")))
    }
}

impl TryFrom<String> for Dialect {
    type Error = HarnessError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Dialect> for String {
    fn from(d: Dialect) -> Self {
        d.name().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Code {
    /// Executed verbatim: a primitive or a python script.
    Script(String),
    Operations(Vec<OperationGroup>),
}

/// One unit of model output routed to the executor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CodeBlock {
    pub code: Code,
    /// Commentary only; never executed.
    pub is_descriptive: bool,
    /// Prepended to the script before execution.
    pub prefix: Option<String>,
}

impl CodeBlock {
    pub fn script(code: impl Into<String>) -> Self {
        Self { code: Code::Script(code.into()), is_descriptive: false, prefix: None }
    }

    pub fn descriptive(text: impl Into<String>) -> Self {
        Self { code: Code::Script(text.into()), is_descriptive: true, prefix: None }
    }

    pub fn operations(groups: Vec<OperationGroup>) -> Self {
        Self { code: Code::Operations(groups), is_descriptive: false, prefix: None }
    }

    pub fn is_primitive(&self, names: &[&str]) -> bool {
        match &self.code {
            Code::Script(s) => primitive::is_primitive(s, names),
            Code::Operations(_) => false,
        }
    }

    /// Appends `prefix` after any existing one, blank parts dropped.
    pub fn push_prefix(&mut self, prefix: &str) {
        let parts: Vec<&str> = [self.prefix.as_deref().unwrap_or_default(), prefix.trim()]
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect();
        self.prefix = (!parts.is_empty()).then(|| parts.join("\n\n"));
    }
}

pub struct ExtractContext {
    /// Primitive names the model may use.
    pub primitives: Vec<&'static str>,
    pub compile: CompileOptions,
    pub tags: Option<Vec<Tag>>,
}

impl ExtractContext {
    pub fn new(compile: CompileOptions) -> Self {
        Self {
            primitives: primitive::invocable_names(),
            compile,
            tags: None,
        }
    }

    pub fn with_tags(mut self, tags: Option<Vec<Tag>>) -> Self {
        self.tags = tags;
        self
    }
}

/// Turns one model response into code blocks for the executor.
pub fn extract(
    response: &ModelResponse,
    dialect: Dialect,
    ctx: &ExtractContext,
) -> HarnessResult<Vec<CodeBlock>> {
    let text = response.single_text()?;
    extract_text(text, dialect, ctx)
}

pub fn extract_text(
    text: &str,
    dialect: Dialect,
    ctx: &ExtractContext,
) -> HarnessResult<Vec<CodeBlock>> {
    let mut blocks = (dialect.entry().extract)(text, ctx)?;

    if let Some(tags) = &ctx.tags {
        let legend = tag_legend(tags);
        for block in blocks
            .iter_mut()
            .filter(|b| !b.is_descriptive && !b.is_primitive(&ctx.primitives))
        {
            block.push_prefix(&legend);
        }
    }

    tracing::debug!(dialect = %dialect, blocks = blocks.len(), "response extracted");
    Ok(blocks)
}
