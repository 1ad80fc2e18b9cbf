//! Translation of a parsed action into atomic device operations.

use serde::{Deserialize, Serialize};

use crate::action::{ActionKind, ActionRecord, Direction};
use crate::coords::AbsoluteBox;

/// Pause between the two taps of a double click.
pub const DOUBLE_TAP_GAP_MS: u64 = 100;
/// A long press stands in for a right click.
pub const LONG_PRESS_MS: u64 = 1000;
pub const DRAG_DURATION_MS: u64 = 500;
/// Drag distance when only a direction is given.
pub const DRAG_DISTANCE_PX: i64 = 150;
pub const SCROLL_DURATION_MS: u64 = 300;
pub const SCROLL_DISTANCE_PX: i64 = 500;
pub const WAIT_MS: u64 = 5000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DeviceCommand {
    Tap { x: i64, y: i64 },
    Swipe { x1: i64, y1: i64, x2: i64, y2: i64, duration_ms: u64 },
    TextInput { payload: String },
    KeyEvent { code: String },
    Sleep { ms: u64 },
    Noop { reason: String },
}

impl DeviceCommand {
    /// Whether the command has to go through the device channel.
    pub fn is_device_bound(&self) -> bool {
        !matches!(self, Self::Sleep { .. } | Self::Noop { .. })
    }
}

/// Commands synthesized for one step, bound to their target device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSequence {
    device_id: String,
    commands: Vec<DeviceCommand>,
}

impl CommandSequence {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn commands(&self) -> &[DeviceCommand] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }
}

/// Android key code for a hotkey name, case-insensitive.
pub fn keycode_for(key: &str) -> Option<&'static str> {
    let code = match key.trim().to_ascii_lowercase().as_str() {
        "enter" => "KEYCODE_ENTER",
        "back" => "KEYCODE_BACK",
        "home" => "KEYCODE_HOME",
        "menu" => "KEYCODE_MENU",
        "escape" => "KEYCODE_ESCAPE",
        "delete" | "backspace" => "KEYCODE_DEL",
        _ => return None,
    };
    Some(code)
}

fn offset(point: (i64, i64), direction: Direction, distance: i64) -> (i64, i64) {
    let (x, y) = point;
    match direction {
        Direction::Up => (x, y - distance),
        Direction::Down => (x, y + distance),
        Direction::Left => (x - distance, y),
        Direction::Right => (x + distance, y),
    }
}

fn swipe(from: (i64, i64), to: (i64, i64), duration_ms: u64) -> DeviceCommand {
    DeviceCommand::Swipe {
        x1: from.0,
        y1: from.1,
        x2: to.0,
        y2: to.1,
        duration_ms,
    }
}

/// Deterministic mapping from an action to device commands.
///
/// Actions missing the geometry or payload they need produce an empty
/// sequence, which callers treat as a no-op.
pub fn synthesize(
    action: &ActionRecord,
    start_abs: Option<&AbsoluteBox>,
    end_abs: Option<&AbsoluteBox>,
    device_id: &str,
) -> CommandSequence {
    let start = start_abs.map(AbsoluteBox::midpoint);
    let mut commands = Vec::new();

    match action.action {
        ActionKind::Click => {
            if let Some((x, y)) = start {
                commands.push(DeviceCommand::Tap { x, y });
            }
        }
        ActionKind::DoubleClick => {
            if let Some((x, y)) = start {
                commands.push(DeviceCommand::Tap { x, y });
                commands.push(DeviceCommand::Sleep { ms: DOUBLE_TAP_GAP_MS });
                commands.push(DeviceCommand::Tap { x, y });
            }
        }
        ActionKind::RightClick => {
            if let Some(point) = start {
                commands.push(swipe(point, point, LONG_PRESS_MS));
            }
        }
        ActionKind::Drag => {
            if let Some(point) = start {
                if let Some(end) = end_abs {
                    commands.push(swipe(point, end.midpoint(), DRAG_DURATION_MS));
                } else if let Some(direction) = action.direction {
                    let target = offset(point, direction, DRAG_DISTANCE_PX);
                    commands.push(swipe(point, target, DRAG_DURATION_MS));
                }
            }
        }
        ActionKind::Scroll => {
            if let Some(point) = start {
                // The finger moves against the direction the content should scroll.
                let content = action.direction.unwrap_or(Direction::Down);
                let finger = match content {
                    Direction::Up => Direction::Down,
                    Direction::Down => Direction::Up,
                    Direction::Left => Direction::Right,
                    Direction::Right => Direction::Left,
                };
                let target = offset(point, finger, SCROLL_DISTANCE_PX);
                commands.push(swipe(point, target, SCROLL_DURATION_MS));
            }
        }
        ActionKind::Type => {
            if let Some(content) = action.content.as_deref().filter(|c| !c.is_empty()) {
                commands.push(DeviceCommand::TextInput {
                    payload: content.to_string(),
                });
            }
        }
        ActionKind::Hotkey => {
            if let Some(code) = action.key.as_deref().and_then(keycode_for) {
                commands.push(DeviceCommand::KeyEvent {
                    code: code.to_string(),
                });
            }
        }
        ActionKind::Wait => commands.push(DeviceCommand::Sleep { ms: WAIT_MS }),
        ActionKind::Finished => commands.push(DeviceCommand::Noop {
            reason: format!(
                "task finished: {}",
                action.content.as_deref().unwrap_or_default()
            ),
        }),
        ActionKind::Unknown => {}
    }

    CommandSequence {
        device_id: device_id.to_string(),
        commands,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::parse_action_output;
    use crate::coords::map_box;

    const SCREEN: (u32, u32) = (1080, 1920);

    fn plan(text: &str) -> CommandSequence {
        let action = parse_action_output(text).record;
        let start = action.start_box.and_then(|b| map_box(&b, SCREEN).ok());
        let end = action.end_box.and_then(|b| map_box(&b, SCREEN).ok());
        synthesize(&action, start.as_ref(), end.as_ref(), "emulator-5554")
    }

    #[test]
    fn click_taps_box_center() {
        let seq = plan("Action: click(start_box='[100,200,300,400]')");
        assert_eq!(seq.device_id(), "emulator-5554");
        assert_eq!(seq.commands(), &[DeviceCommand::Tap { x: 216, y: 576 }]);
    }

    #[test]
    fn double_click_pauses_between_taps() {
        let seq = plan("Action: left_double(start_box='[100,200,300,400]')");
        assert_eq!(
            seq.commands(),
            &[
                DeviceCommand::Tap { x: 216, y: 576 },
                DeviceCommand::Sleep { ms: DOUBLE_TAP_GAP_MS },
                DeviceCommand::Tap { x: 216, y: 576 },
            ]
        );
    }

    #[test]
    fn right_click_is_long_press() {
        let seq = plan("Action: right_single(start_box='[100,200,300,400]')");
        assert_eq!(
            seq.commands(),
            &[DeviceCommand::Swipe { x1: 216, y1: 576, x2: 216, y2: 576, duration_ms: LONG_PRESS_MS }]
        );
    }

    #[test]
    fn scroll_down_swipes_finger_up() {
        let seq = plan("Action: scroll(start_box='[500,500,600,600]', direction='down')");
        // [540, 960, 648, 1152] -> center (594, 1056)
        assert_eq!(
            seq.commands(),
            &[DeviceCommand::Swipe { x1: 594, y1: 1056, x2: 594, y2: 556, duration_ms: SCROLL_DURATION_MS }]
        );
    }

    #[test]
    fn scroll_without_direction_defaults_down() {
        let seq = plan("Action: scroll(start_box='[500,500,600,600]')");
        assert!(matches!(seq.commands(), [DeviceCommand::Swipe { y2: 556, .. }]));
    }

    #[test]
    fn drag_by_direction_moves_fixed_distance() {
        let seq = plan("Action: drag(start_box='[100,200,300,400]', direction='right')");
        assert_eq!(
            seq.commands(),
            &[DeviceCommand::Swipe { x1: 216, y1: 576, x2: 366, y2: 576, duration_ms: DRAG_DURATION_MS }]
        );
    }

    #[test]
    fn drag_end_box_wins_over_direction() {
        let seq = plan(
            "Action: drag(start_box='[100,200,300,400]', end_box='[500,500,600,600]', direction='up')",
        );
        assert_eq!(
            seq.commands(),
            &[DeviceCommand::Swipe { x1: 216, y1: 576, x2: 594, y2: 1056, duration_ms: DRAG_DURATION_MS }]
        );
    }

    #[test]
    fn type_sends_text_without_focus_tap() {
        let seq = plan("Action: type(content='coffee\\n')");
        assert_eq!(
            seq.commands(),
            &[DeviceCommand::TextInput { payload: "coffee\n".into() }]
        );
    }

    #[test]
    fn hotkeys_use_keycode_table() {
        let seq = plan("Action: hotkey(key='Backspace')");
        assert_eq!(
            seq.commands(),
            &[DeviceCommand::KeyEvent { code: "KEYCODE_DEL".into() }]
        );
        assert!(plan("Action: hotkey(key='ctrl+c')").is_empty());
    }

    #[test]
    fn wait_finished_and_unknown() {
        assert_eq!(plan("Action: wait()").commands(), &[DeviceCommand::Sleep { ms: WAIT_MS }]);
        assert!(matches!(
            plan("Action: finished(content='ok')").commands(),
            [DeviceCommand::Noop { .. }]
        ));
        assert!(plan("nothing to see").is_empty());
        assert!(plan("Action: click()").is_empty());
    }

    #[test]
    fn synthesis_is_deterministic() {
        let action = parse_action_output("Action: drag(start_box='[1,2,3,4]', direction='left')").record;
        let start = map_box(&action.start_box.unwrap(), SCREEN).unwrap();
        let first = synthesize(&action, Some(&start), None, "dev");
        let second = synthesize(&action, Some(&start), None, "dev");
        assert_eq!(first, second);
    }
}
