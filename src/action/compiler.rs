use crate::action::types::{
    ActionType, CoordinateSpace, DeviceOperation, InputMode, MouseButton, OperationGroup,
    ParsedAction, Point, ScrollAxis, TerminalKind,
};
use crate::perception::resize::{box_center, round3};

/// Pause after typing or pasting text.
pub const TYPE_SETTLE_SECS: f64 = 0.5;
/// Pause between successive actions of one response.
pub const INTER_ACTION_SECS: f64 = 3.0;
pub const DRAG_DURATION_SECS: f64 = 1.0;
pub const SCROLL_STEP: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompileOptions {
    pub screen_width: u32,
    pub screen_height: u32,
    pub input_mode: InputMode,
    /// Space the emitted points are expressed in.
    pub space: CoordinateSpace,
}

impl CompileOptions {
    fn point(&self, bx: &[f64; 4]) -> Point {
        let (x, y) = box_center(bx);
        self.fraction_point(x, y)
    }

    /// A point given as fractions of the screen, in the configured space.
    pub fn fraction_point(&self, x: f64, y: f64) -> Point {
        match self.space {
            CoordinateSpace::Normalized => Point::normalized(x, y),
            CoordinateSpace::Pixel => Point::pixel(
                round3(x * self.screen_width as f64),
                round3(y * self.screen_height as f64),
            ),
        }
    }
}

fn map_key(key: &str) -> String {
    match key {
        "arrowleft" => "left".into(),
        "arrowright" => "right".into(),
        "arrowup" => "up".into(),
        "arrowdown" => "down".into(),
        "space" => " ".into(),
        other => other.to_string(),
    }
}

fn key_sequence(input: &str) -> Vec<String> {
    input.split_whitespace().map(map_key).collect()
}

/// `"key"` wins over the action-named fallback (`hotkey=`, `press=`).
fn key_input<'a>(action: &'a ParsedAction, fallback: &str) -> &'a str {
    action
        .text("key")
        .or_else(|| action.text(fallback))
        .unwrap_or_default()
}

/// Drops every trailing newline marker, real or escaped. Returns the text and
/// whether any marker was found.
fn strip_newline_markers(text: &str) -> (&str, bool) {
    let mut rest = text;
    loop {
        if let Some(s) = rest.strip_suffix("\\n") {
            rest = s;
        } else if let Some(s) = rest.strip_suffix('\n') {
            rest = s;
        } else {
            break;
        }
    }
    (rest, rest.len() != text.len())
}

fn compile_type(content: &str, mode: InputMode) -> OperationGroup {
    if content.is_empty() {
        return Vec::new();
    }
    let (text, submit) = strip_newline_markers(content);
    let mut ops = match mode {
        InputMode::Clipboard => vec![
            DeviceOperation::CopyToClipboard { text: text.to_string() },
            DeviceOperation::HotKey { keys: vec!["ctrl".into(), "v".into()] },
        ],
        InputMode::Keystroke => vec![DeviceOperation::TypeText { text: text.to_string() }],
    };
    ops.push(DeviceOperation::Wait { seconds: TYPE_SETTLE_SECS });
    if submit {
        ops.push(DeviceOperation::KeyPress { key: "enter".into() });
    }
    ops
}

/// Compiles one action into an atomic operation group. Unsupported actions
/// yield a single [`DeviceOperation::Noop`]; missing inputs yield nothing.
pub fn compile(action: &ParsedAction, opts: &CompileOptions) -> OperationGroup {
    match &action.action_type {
        ActionType::Hotkey => {
            let keys = key_sequence(key_input(action, "hotkey"));
            if keys.is_empty() {
                return Vec::new();
            }
            vec![DeviceOperation::HotKey { keys }]
        }

        // one press per key, in order
        ActionType::Press => key_sequence(key_input(action, "press"))
            .into_iter()
            .map(|key| DeviceOperation::KeyPress { key })
            .collect(),

        ActionType::KeyUp | ActionType::KeyDown => {
            let key = action.text("key").unwrap_or_default();
            if key.is_empty() {
                return Vec::new();
            }
            let key = key.to_string();
            if action.action_type == ActionType::KeyUp {
                vec![DeviceOperation::KeyUp { key }]
            } else {
                vec![DeviceOperation::KeyDown { key }]
            }
        }

        ActionType::Type => {
            compile_type(action.text("content").unwrap_or_default(), opts.input_mode)
        }

        ActionType::Drag | ActionType::Select => {
            match (action.bbox("start_box"), action.bbox("end_box")) {
                (Some(start), Some(end)) => vec![DeviceOperation::Drag {
                    from: opts.point(start),
                    to: opts.point(end),
                    duration: DRAG_DURATION_SECS,
                }],
                _ => Vec::new(),
            }
        }

        ActionType::Scroll => {
            let anchor = action.bbox("start_box").map(|b| opts.point(b));
            let direction = action.text("direction").unwrap_or_default().to_lowercase();
            let amount = if direction.contains("up") {
                SCROLL_STEP
            } else if direction.contains("down") {
                -SCROLL_STEP
            } else {
                return Vec::new();
            };
            vec![DeviceOperation::Scroll { amount, anchor, axis: ScrollAxis::Vertical }]
        }

        ActionType::Click
        | ActionType::LeftSingle
        | ActionType::LeftDouble
        | ActionType::RightSingle
        | ActionType::Hover => {
            let Some(bx) = action.bbox("start_box") else {
                return vec![DeviceOperation::Noop {
                    reason: format!("{} without start_box", action.action_type),
                }];
            };
            let at = opts.point(bx);
            let op = match action.action_type {
                ActionType::LeftDouble => DeviceOperation::DoubleClick { at },
                ActionType::RightSingle => DeviceOperation::Click { at, button: MouseButton::Right },
                ActionType::Hover => DeviceOperation::MoveTo { at },
                _ => DeviceOperation::Click { at, button: MouseButton::Left },
            };
            vec![op]
        }

        ActionType::Finished => vec![DeviceOperation::Terminal { kind: TerminalKind::Done }],

        other => {
            tracing::warn!(action_type = %other, "unrecognized action type");
            vec![DeviceOperation::Noop {
                reason: format!("Unrecognized action type: {other}"),
            }]
        }
    }
}

/// Compiles a whole response. A `finished` anywhere wins and is returned
/// alone; otherwise groups are separated by a fixed pause.
pub fn compile_batch(actions: &[ParsedAction], opts: &CompileOptions) -> Vec<OperationGroup> {
    if actions.iter().any(|a| a.action_type == ActionType::Finished) {
        return vec![vec![DeviceOperation::Terminal { kind: TerminalKind::Done }]];
    }

    let mut groups = Vec::new();
    for (index, action) in actions.iter().enumerate() {
        if index > 0 {
            groups.push(vec![DeviceOperation::Wait { seconds: INTER_ACTION_SECS }]);
        }
        let group = compile(action, opts);
        if !group.is_empty() {
            groups.push(group);
        }
    }
    groups
}
