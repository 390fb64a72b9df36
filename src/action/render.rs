/// Renders operation groups as `pyautogui` scripts for the VM's python
/// executor.
use crate::action::types::{DeviceOperation, MouseButton, Point, ScrollAxis, TerminalKind};
use crate::perception::resize::round3;

/// Single-quoted Python string literal.
pub fn py_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn num(v: f64) -> String {
    let v = round3(v);
    if v.fract() == 0.0 {
        format!("{v:.0}")
    } else {
        format!("{v}")
    }
}

pub struct ScriptRenderer {
    pub screen_width: u32,
    pub screen_height: u32,
}

impl ScriptRenderer {
    pub fn new(screen_width: u32, screen_height: u32) -> Self {
        Self { screen_width, screen_height }
    }

    fn xy(&self, p: &Point) -> String {
        let (x, y) = p.to_screen(self.screen_width, self.screen_height);
        format!("{}, {}", num(x), num(y))
    }

    fn line(&self, op: &DeviceOperation) -> String {
        match op {
            DeviceOperation::Click { at, button } => {
                let button = match button {
                    MouseButton::Left => "left",
                    MouseButton::Right => "right",
                };
                format!("pyautogui.click({}, button='{button}')", self.xy(at))
            }
            DeviceOperation::DoubleClick { at } => {
                format!("pyautogui.doubleClick({}, button='left')", self.xy(at))
            }
            DeviceOperation::MoveTo { at } => format!("pyautogui.moveTo({})", self.xy(at)),
            DeviceOperation::Drag { from, to, duration } => format!(
                "pyautogui.moveTo({})\npyautogui.dragTo({}, duration={})",
                self.xy(from),
                self.xy(to),
                num(*duration)
            ),
            DeviceOperation::Scroll { amount, anchor, axis } => {
                let func = match axis {
                    ScrollAxis::Vertical => "scroll",
                    ScrollAxis::Horizontal => "hscroll",
                };
                match anchor {
                    Some(p) => {
                        let (x, y) = p.to_screen(self.screen_width, self.screen_height);
                        format!("pyautogui.{func}({amount}, x={}, y={})", num(x), num(y))
                    }
                    None => format!("pyautogui.{func}({amount})"),
                }
            }
            DeviceOperation::HotKey { keys } => {
                let keys: Vec<String> = keys.iter().map(|k| py_str(k)).collect();
                format!("pyautogui.hotkey({})", keys.join(", "))
            }
            DeviceOperation::KeyPress { key } => format!("pyautogui.press({})", py_str(key)),
            DeviceOperation::KeyUp { key } => format!("pyautogui.keyUp({})", py_str(key)),
            DeviceOperation::KeyDown { key } => format!("pyautogui.keyDown({})", py_str(key)),
            DeviceOperation::TypeText { text } => {
                format!("pyautogui.write({}, interval=0.1)", py_str(text))
            }
            DeviceOperation::CopyToClipboard { text } => {
                format!("pyperclip.copy({})", py_str(text))
            }
            DeviceOperation::Wait { seconds } => format!("time.sleep({})", num(*seconds)),
            DeviceOperation::Terminal { kind } => match kind {
                TerminalKind::Done => "# DONE".to_string(),
                TerminalKind::Fail => "# FAIL".to_string(),
            },
            DeviceOperation::Noop { reason } => format!("# {}", reason.replace('\n', " ")),
        }
    }

    pub fn render_group(&self, ops: &[DeviceOperation]) -> String {
        let mut lines = vec!["import pyautogui".to_string(), "import time".to_string()];
        if ops.iter().any(|op| matches!(op, DeviceOperation::CopyToClipboard { .. })) {
            lines.push("import pyperclip".to_string());
        }
        lines.extend(ops.iter().map(|op| self.line(op)));
        lines.join("\n")
    }
}
