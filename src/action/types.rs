use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Action vocabulary of the Thought/Action dialects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Click,
    LeftSingle,
    LeftDouble,
    RightSingle,
    Hover,
    Hotkey,
    Press,
    KeyUp,
    KeyDown,
    Type,
    Drag,
    Select,
    Scroll,
    Finished,
    Wait,
    ErrorEnv,
    CallUser,
    Unrecognized(String),
}

impl ActionType {
    pub fn from_name(name: &str) -> Self {
        match name {
            "click" => Self::Click,
            "left_single" => Self::LeftSingle,
            "left_double" => Self::LeftDouble,
            "right_single" => Self::RightSingle,
            "hover" => Self::Hover,
            "hotkey" => Self::Hotkey,
            "press" => Self::Press,
            "keyup" => Self::KeyUp,
            "keydown" => Self::KeyDown,
            "type" => Self::Type,
            "drag" => Self::Drag,
            "select" => Self::Select,
            "scroll" => Self::Scroll,
            "finished" => Self::Finished,
            "wait" => Self::Wait,
            "error_env" => Self::ErrorEnv,
            "call_user" => Self::CallUser,
            other => Self::Unrecognized(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Click => "click",
            Self::LeftSingle => "left_single",
            Self::LeftDouble => "left_double",
            Self::RightSingle => "right_single",
            Self::Hover => "hover",
            Self::Hotkey => "hotkey",
            Self::Press => "press",
            Self::KeyUp => "keyup",
            Self::KeyDown => "keydown",
            Self::Type => "type",
            Self::Drag => "drag",
            Self::Select => "select",
            Self::Scroll => "scroll",
            Self::Finished => "finished",
            Self::Wait => "wait",
            Self::ErrorEnv => "error_env",
            Self::CallUser => "call_user",
            Self::Unrecognized(name) => name,
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A keyword argument value after box normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionArg {
    Text(String),
    /// `[x1, y1, x2, y2]` as screen fractions.
    Box([f64; 4]),
}

impl ActionArg {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Box(_) => None,
        }
    }

    pub fn as_box(&self) -> Option<&[f64; 4]> {
        match self {
            Self::Box(b) => Some(b),
            Self::Text(_) => None,
        }
    }
}

impl fmt::Display for ActionArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Box([a, b, c, d]) => write!(f, "[{a}, {b}, {c}, {d}]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedAction {
    pub action_type: ActionType,
    pub inputs: BTreeMap<String, ActionArg>,
    pub reflection: Option<String>,
    pub thought: Option<String>,
    /// Whole model response this action was cut from.
    pub raw_text: String,
}

impl ParsedAction {
    pub fn text(&self, key: &str) -> Option<&str> {
        self.inputs.get(key).and_then(ActionArg::as_text)
    }

    pub fn bbox(&self, key: &str) -> Option<&[f64; 4]> {
        self.inputs.get(key).and_then(ActionArg::as_box)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateSpace {
    /// Fractions of the screen in `[0, 1]`.
    Normalized,
    /// Pixels of the resized screenshot.
    Pixel,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub space: CoordinateSpace,
}

impl Point {
    pub fn normalized(x: f64, y: f64) -> Self {
        Self { x, y, space: CoordinateSpace::Normalized }
    }

    pub fn pixel(x: f64, y: f64) -> Self {
        Self { x, y, space: CoordinateSpace::Pixel }
    }

    /// Absolute screen position.
    pub fn to_screen(&self, screen_width: u32, screen_height: u32) -> (f64, f64) {
        match self.space {
            CoordinateSpace::Normalized => {
                (self.x * screen_width as f64, self.y * screen_height as f64)
            }
            CoordinateSpace::Pixel => (self.x, self.y),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollAxis {
    Vertical,
    Horizontal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalKind {
    Done,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    /// Copy the text and paste it with ctrl+v.
    #[default]
    Clipboard,
    /// Type the text key by key.
    Keystroke,
}

/// One concrete keyboard/mouse command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DeviceOperation {
    Click { at: Point, button: MouseButton },
    DoubleClick { at: Point },
    MoveTo { at: Point },
    /// Press at `from`, drag to `to`, release. Never split.
    Drag { from: Point, to: Point, duration: f64 },
    Scroll { amount: i32, anchor: Option<Point>, axis: ScrollAxis },
    HotKey { keys: Vec<String> },
    KeyPress { key: String },
    KeyUp { key: String },
    KeyDown { key: String },
    TypeText { text: String },
    CopyToClipboard { text: String },
    Wait { seconds: f64 },
    Terminal { kind: TerminalKind },
    /// Placeholder for an action the compiler does not support.
    Noop { reason: String },
}

impl DeviceOperation {
    pub fn is_wait(&self) -> bool {
        matches!(self, Self::Wait { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal { .. })
    }
}

/// Operations that execute together; cancellation is only observed between
/// groups.
pub type OperationGroup = Vec<DeviceOperation>;
