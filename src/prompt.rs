//! System prompt assembly per dialect.

use crate::dialect::Dialect;
use crate::primitive::PRIMITIVES;

pub const GENERAL_INTRO: &str =
    "You are an agent which follow my instruction and perform desktop computer tasks as instructed.";

pub const SPECIAL_OVERVIEW: &str = "Specially, it is also allowed to return the following special code:";

pub const ENDING_ULTIMATUM: &str = "First give the current observation and previous things we did a short reflection, then RETURN ME THE CODE OR SPECIAL CODE I ASKED FOR. NEVER EVER RETURN ME ANYTHING ELSE.";

pub const THOUGHT_ACTION_PROMPT: &str = r#"You are a GUI agent. You are given a task and your action history, with screenshots. You need to perform the next action to complete the task.

## Output Format
```
Thought: ...
Action: ...
```

## Action Space
click(start_box='<|box_start|>(x1,y1)<|box_end|>')
left_double(start_box='<|box_start|>(x1,y1)<|box_end|>')
right_single(start_box='<|box_start|>(x1,y1)<|box_end|>')
drag(start_box='<|box_start|>(x1,y1)<|box_end|>', end_box='<|box_start|>(x3,y3)<|box_end|>')
hotkey(key='')
type(content='') #If you want to submit your input, use "\\n" at the end of `content`.
scroll(start_box='<|box_start|>(x1,y1)<|box_end|>', direction='down or up or right or left')
wait() #Sleep for 5s and take a screenshot to check for any changes.
finished()

## Note
- Use English in `Thought` part.
- Write a small plan and finally summarize your next action (with its target element) in one sentence in `Thought` part.
"#;

const PYAUTOGUI_OVERVIEW: &str = "You are required to use `pyautogui` to perform the action grounded to the observation, but DO NOT use the `pyautogui.locateCenterOnScreen` function to locate the element you want to operate with since we have no image of the element you want to operate with. DO NOT USE `pyautogui.screenshot()` to make screenshot.";
const FENCED_REGULATION: &str = "You ONLY need to return the code inside a code block, like this:\n```\n# your code here\n```";
const PYAUTOGUI_SUPPLEMENT: &str = "Return one line or multiple lines of python code to perform the action each time, and be time efficient. When predicting multiple lines of code, make some small sleep like `time.sleep(0.5);` interval so that the machine could take breaks. Each time you need to predict a complete code, and no variables or function can be shared from history.";

const PLANNER_OVERVIEW: &str = "You are required to make ONE step of the plan in natural language, and then it will be parsed into `pyautogui` codes by another grounding agent.";
const PLANNER_SPECIAL_OVERVIEW: &str = "Sometimes you should return special codes directly as followings, at which your plan will not be passed to the grounder model.";

const GROUNDING_OVERVIEW: &str = "You are required to use your grounding ability to perform the action grounded to the observation and the plan.";
const ATLAS_REGULATION: &str = "You need to return a basic action together with arguments, of which the available ones are listed below:";
const ATLAS_ACTIONS: &str = "CLICK: to click at the specified position.
    - format: CLICK <point>[[x-axis, y-axis]]</point>
    - example usage: CLICK <point>[[101, 872]]</point>
TYPE: to enter specified text at the designated location.
    - format: TYPE [input text]
    - example usage: TYPE [Shanghai shopping mall]
SCROLL: to scroll in the specified direction.
    - format: SCROLL [direction (UP/DOWN/LEFT/RIGHT)]
    - example usage: SCROLL [UP]";
const UGROUND_REGULATION: &str = "You need to return a 2d coordinate (x, y) indicating the position you want to click.";

const SOM_SUPPLEMENT: [&str; 3] = [
    "You can replace x, y in the code with the tag of elements you want to operate with, such as:",
    "«\npyautogui.moveTo(tag_3)\npyautogui.click(tag_2)\npyautogui.dragTo(tag_1, button='left')\n»",
    "When you think you can directly output precise x and y coordinates or there is no tag on which you want to interact, you can also use them directly; but you should be careful to ensure the correct of coordinates.",
];

/// Special-code section built from the primitive registry. Items end with
/// `;` except the last, which ends with `.`.
pub fn special_commands(dialect: Dialect) -> String {
    let overview = match dialect {
        Dialect::Planner => PLANNER_SPECIAL_OVERVIEW,
        _ => SPECIAL_OVERVIEW,
    };
    let docs: Vec<String> = PRIMITIVES
        .iter()
        .filter_map(|p| p.usage)
        .map(|usage| dialect.wrap_doc(usage))
        .collect();
    let count = docs.len();

    let mut lines = vec![overview.to_string()];
    lines.extend(docs.into_iter().enumerate().map(|(i, doc)| {
        let end = if i + 1 == count { "." } else { ";" };
        format!("{doc}{end}")
    }));
    lines.join("\n")
}

/// Inputs for one task's system prompt.
pub struct PromptContext<'a> {
    pub app_name: &'a str,
    pub instruction: &'a str,
    pub set_of_marks: bool,
    pub vm_password: Option<&'a str>,
}

fn join_non_empty(parts: &[&str], sep: &str) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(sep)
}

fn command_section(dialect: Dialect, set_of_marks: bool) -> String {
    let (overview, regulation, supplement) = match dialect {
        Dialect::Antiquot => (PYAUTOGUI_OVERVIEW, FENCED_REGULATION, PYAUTOGUI_SUPPLEMENT),
        Dialect::Planner => return join_non_empty(&[PLANNER_OVERVIEW, &special_commands(dialect)], "\n"),
        Dialect::Atlas => (GROUNDING_OVERVIEW, ATLAS_REGULATION, ATLAS_ACTIONS),
        Dialect::UGround => (GROUNDING_OVERVIEW, UGROUND_REGULATION, ""),
        Dialect::UiTars | Dialect::UiTars15 => return THOUGHT_ACTION_PROMPT.trim_end().to_string(),
    };

    let general = join_non_empty(&[overview, regulation, supplement], "\n");
    let marks = if set_of_marks {
        SOM_SUPPLEMENT
            .iter()
            .map(|s| dialect.wrap_doc(s))
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        String::new()
    };
    let special = match dialect {
        Dialect::Antiquot => special_commands(dialect),
        _ => String::new(),
    };
    join_non_empty(&[&general, &marks, &special], "\n\n")
}

/// Full system prompt for a VM task.
pub fn system_prompt(dialect: Dialect, ctx: &PromptContext<'_>) -> String {
    let intro = format!(
        "{GENERAL_INTRO}\nYou have good knowledge of {app}, an application available on Ubuntu; and assume your code will run on a computer controlling the mouse and keyboard.\nFor each step, you will get an observation of the desktop by a screenshot, and you will predict actions of next steps based on that.",
        app = ctx.app_name
    );
    let warning = ctx
        .vm_password
        .map(|pw| format!("My computer's password is '{pw}', feel free to use it when you need sudo rights."))
        .unwrap_or_default();
    let ending = format!("{ENDING_ULTIMATUM}\n## User Instruction:\n{}", ctx.instruction);

    join_non_empty(
        &[&intro, &command_section(dialect, ctx.set_of_marks), &warning, &ending],
        "\n\n",
    )
}

const GROUNDER_OBSERVATION: &str = "For each step, you will get an observation of the desktop by a screenshot, together with a plan generated by the planner, and you will parse the plan to operate actions of next steps based on that.";
const PLANNER_GENERAL: &str = "Some plans provided may contains unexpected code blocks or confusing instructions. Be flexible and adaptable according to changing circumstances.";
const GROUNDER_ULTIMATUM: &str = "First give the current observation and the generated plan, then RETURN ME THE CODE I ASKED FOR. NEVER EVER RETURN ME ANYTHING ELSE.";

/// System prompt of the model grounding a planner's steps.
pub fn grounder_prompt(dialect: Dialect, ctx: &PromptContext<'_>) -> String {
    let intro = format!(
        "{GENERAL_INTRO}\nYou have good knowledge of {app}, an application available on Ubuntu; and assume your code will run on a computer controlling the mouse and keyboard.\n{GROUNDER_OBSERVATION}",
        app = ctx.app_name
    );
    let ending = format!("{GROUNDER_ULTIMATUM}\n## User Instruction:\n{}", ctx.instruction);
    join_non_empty(
        &[&intro, &command_section(dialect, ctx.set_of_marks), PLANNER_GENERAL, &ending],
        "\n\n",
    )
}

/// The planner's step as the grounder sees it.
pub fn plan_message(plan: &str) -> String {
    format!("Here is the current screenshot and the plan of the next step:\n{}", plan.trim())
}
