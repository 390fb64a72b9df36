use std::sync::OnceLock;

use regex::Regex;

use super::{CodeBlock, ExtractContext};
use crate::action::types::{ActionType, MouseButton, ParsedAction, ScrollAxis};
use crate::action::{compile_batch, parse, CompileOptions, DeviceOperation, ParseProfile};
use crate::errors::GrammarError;
use crate::primitive::Primitive;

macro_rules! static_regex {
    ($name:ident, $pattern:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pattern).expect("static regex"))
        }
    };
}

static_regex!(fenced, r"```(?:\w*\s+)?([\w\W]*?)```");
static_regex!(atlas_any, r"(CLICK <point>\[\[(\d+), ?(\d+)\]\]</point>|TYPE \[(.+?)\]|SCROLL \[(UP|DOWN|LEFT|RIGHT)\])");
static_regex!(bare_point, r"\((\d+), ?(\d+)\)");

/// Grounding dialects report clicks in thousandths of the screen.
const GROUNDING_FACTOR: f64 = 1000.0;
const ATLAS_SCROLL_STEP: i32 = 10;

fn fenced_blocks(text: &str) -> Vec<String> {
    fenced()
        .captures_iter(text)
        .map(|c| c[1].trim().to_string())
        .collect()
}

fn click_at(x: &str, y: &str, opts: &CompileOptions) -> Option<DeviceOperation> {
    let x: f64 = x.parse().ok()?;
    let y: f64 = y.parse().ok()?;
    Some(DeviceOperation::Click {
        at: opts.fraction_point(x / GROUNDING_FACTOR, y / GROUNDING_FACTOR),
        button: MouseButton::Left,
    })
}

pub(super) fn antiquot(text: &str, _ctx: &ExtractContext) -> Result<Vec<CodeBlock>, GrammarError> {
    Ok(fenced_blocks(text).into_iter().map(CodeBlock::script).collect())
}

pub(super) fn planner(text: &str, ctx: &ExtractContext) -> Result<Vec<CodeBlock>, GrammarError> {
    let codes: Vec<CodeBlock> = fenced_blocks(text)
        .into_iter()
        .map(CodeBlock::script)
        .filter(|c| c.is_primitive(&ctx.primitives))
        .collect();
    if codes.is_empty() {
        return Ok(vec![CodeBlock::descriptive(text)]);
    }
    Ok(codes)
}

pub(super) fn atlas(text: &str, ctx: &ExtractContext) -> Result<Vec<CodeBlock>, GrammarError> {
    let mut blocks = Vec::new();
    for caps in atlas_any().captures_iter(text) {
        let op = if let (Some(x), Some(y)) = (caps.get(2), caps.get(3)) {
            click_at(x.as_str(), y.as_str(), &ctx.compile)
        } else if let Some(typed) = caps.get(4) {
            Some(DeviceOperation::TypeText { text: typed.as_str().to_string() })
        } else if let Some(direction) = caps.get(5) {
            let (amount, axis) = match direction.as_str() {
                "UP" => (ATLAS_SCROLL_STEP, ScrollAxis::Vertical),
                "DOWN" => (-ATLAS_SCROLL_STEP, ScrollAxis::Vertical),
                "LEFT" => (-ATLAS_SCROLL_STEP, ScrollAxis::Horizontal),
                _ => (ATLAS_SCROLL_STEP, ScrollAxis::Horizontal),
            };
            Some(DeviceOperation::Scroll { amount, anchor: None, axis })
        } else {
            None
        };
        if let Some(op) = op {
            blocks.push(CodeBlock::operations(vec![vec![op]]));
        }
    }
    Ok(blocks)
}

pub(super) fn uground(text: &str, ctx: &ExtractContext) -> Result<Vec<CodeBlock>, GrammarError> {
    Ok(bare_point()
        .captures_iter(text)
        .filter_map(|c| click_at(&c[1], &c[2], &ctx.compile))
        .map(|op| CodeBlock::operations(vec![vec![op]]))
        .collect())
}

/// `wait()` and `error_env()` become the WAIT and FAIL primitives.
fn sentinel(action: &ParsedAction) -> Option<Primitive> {
    match action.action_type {
        ActionType::Wait => Some(Primitive::Wait),
        ActionType::ErrorEnv => Some(Primitive::Fail),
        _ => None,
    }
}

fn thought_action(
    text: &str,
    ctx: &ExtractContext,
    profile: ParseProfile,
) -> Result<Vec<CodeBlock>, GrammarError> {
    let actions = parse(text, &profile)?;

    let (sentinels, executable): (Vec<&ParsedAction>, Vec<&ParsedAction>) =
        actions.iter().partition(|a| sentinel(a).is_some());
    let executable: Vec<ParsedAction> = executable.into_iter().cloned().collect();
    let groups = compile_batch(&executable, &ctx.compile);

    if groups.iter().flatten().any(DeviceOperation::is_terminal) {
        return Ok(vec![CodeBlock::script(Primitive::Done.name())]);
    }

    let mut blocks: Vec<CodeBlock> = sentinels
        .into_iter()
        .filter_map(sentinel)
        .map(|p| CodeBlock::script(p.name()))
        .collect();
    if groups.iter().any(|g| !g.iter().all(DeviceOperation::is_wait)) {
        blocks.push(CodeBlock::operations(groups));
    }
    Ok(blocks)
}

pub(super) fn uitars(text: &str, ctx: &ExtractContext) -> Result<Vec<CodeBlock>, GrammarError> {
    thought_action(text, ctx, ParseProfile::uitars())
}

pub(super) fn uitars15(text: &str, ctx: &ExtractContext) -> Result<Vec<CodeBlock>, GrammarError> {
    let profile = super::Dialect::UiTars15
        .parse_profile(ctx.compile.screen_width, ctx.compile.screen_height)
        .unwrap_or_else(|| ParseProfile::uitars15(ctx.compile.screen_height, ctx.compile.screen_width));
    thought_action(text, ctx, profile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{CoordinateSpace, InputMode, Point};
    use crate::dialect::Code;

    fn ctx() -> ExtractContext {
        ExtractContext::new(CompileOptions {
            screen_width: 1280,
            screen_height: 800,
            input_mode: InputMode::Clipboard,
            space: CoordinateSpace::Normalized,
        })
    }

    fn ops(block: &CodeBlock) -> Vec<DeviceOperation> {
        match &block.code {
            Code::Operations(groups) => groups.iter().flatten().cloned().collect(),
            Code::Script(s) => panic!("expected operations, got script {s}"),
        }
    }

    #[test]
    fn atlas_commands_in_order() {
        let text = "CLICK <point>[[500, 250]]</point>\nTYPE [hello world]\nSCROLL [LEFT]";
        let blocks = atlas(text, &ctx()).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(
            ops(&blocks[0]),
            vec![DeviceOperation::Click { at: Point::normalized(0.5, 0.25), button: MouseButton::Left }]
        );
        assert_eq!(ops(&blocks[1]), vec![DeviceOperation::TypeText { text: "hello world".into() }]);
        assert_eq!(
            ops(&blocks[2]),
            vec![DeviceOperation::Scroll { amount: -10, anchor: None, axis: ScrollAxis::Horizontal }]
        );
    }

    #[test]
    fn uground_reads_bare_points() {
        let blocks = uground("The button is at (120, 80).", &ctx()).unwrap();
        assert_eq!(
            ops(&blocks[0]),
            vec![DeviceOperation::Click { at: Point::normalized(0.12, 0.08), button: MouseButton::Left }]
        );
        assert!(uground("nothing here", &ctx()).unwrap().is_empty());
    }

    #[test]
    fn actions_of_one_response_share_a_block_with_pauses() {
        let text = "Thought: t\nAction: hotkey(key='ctrl a')\n\ntype(content='x')";
        let blocks = uitars(text, &ctx()).unwrap();
        assert_eq!(blocks.len(), 1);
        let Code::Operations(groups) = &blocks[0].code else {
            panic!("expected operations");
        };
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[1], vec![DeviceOperation::Wait { seconds: 3.0 }]);
        assert_eq!(groups[2][0], DeviceOperation::CopyToClipboard { text: "x".into() });
    }

    #[test]
    fn sentinels_come_before_compiled_actions() {
        let text = "Thought: t\nAction: press(key='enter')\n\nwait()";
        let blocks = uitars(text, &ctx()).unwrap();
        assert_eq!(blocks[0], CodeBlock::script("WAIT"));
        assert_eq!(ops(&blocks[1]), vec![DeviceOperation::KeyPress { key: "enter".into() }]);

        let text = "Thought: t\nAction: press(key='enter')\n\nfinished()";
        assert_eq!(uitars(text, &ctx()).unwrap(), vec![CodeBlock::script("DONE")]);
    }

    #[test]
    fn grounding_points_follow_the_context_space() {
        let mut pixel = ctx();
        pixel.compile.space = CoordinateSpace::Pixel;
        let blocks = uground("(500, 250)", &pixel).unwrap();
        assert_eq!(
            ops(&blocks[0]),
            vec![DeviceOperation::Click { at: Point::pixel(640.0, 200.0), button: MouseButton::Left }]
        );
    }

    #[test]
    fn uitars15_boxes_use_resized_screen() {
        let text = "Thought: t\nAction: click(start_box='(644,406)')";
        let blocks = uitars15(text, &ctx()).unwrap();
        assert_eq!(
            ops(&blocks[0]),
            vec![DeviceOperation::Click { at: Point::normalized(0.5, 0.5), button: MouseButton::Left }]
        );
    }
}
