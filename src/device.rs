use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use image::GenericImageView;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::command::{CommandSequence, DeviceCommand};
use crate::error::AgentError;

/// Resolution assumed when `wm size` cannot be read.
pub const DEFAULT_SCREEN_SIZE: (u32, u32) = (1080, 1920);

// ========================= Screen State =========================

#[derive(Clone, Debug)]
pub struct Screenshot {
    pub id: String,
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
}

impl Screenshot {
    /// Decodes the image header to learn the screen dimensions.
    pub fn from_png(png: Vec<u8>) -> Result<Self, AgentError> {
        let img = image::load_from_memory(&png)
            .map_err(|e| AgentError::Capture(format!("decode screenshot: {e}")))?;
        let (width, height) = img.dimensions();
        Ok(Self {
            id: nanoid!(),
            png,
            width,
            height,
            captured_at: Utc::now(),
        })
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn to_data_url(&self) -> String {
        format!("data:image/png;base64,{}", B64.encode(&self.png))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub status: i32,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

// ========================= Device Channel =========================

/// Transport to a device: screen capture plus single-command execution.
#[async_trait]
pub trait DeviceChannel: Send + Sync {
    async fn capture_screen(&self, device_id: &str) -> Result<Screenshot, AgentError>;
    async fn run(&self, device_id: &str, command: &DeviceCommand) -> Result<CommandOutput, AgentError>;
}

#[async_trait]
impl<T: DeviceChannel + ?Sized> DeviceChannel for Arc<T> {
    async fn capture_screen(&self, device_id: &str) -> Result<Screenshot, AgentError> {
        (**self).capture_screen(device_id).await
    }

    async fn run(&self, device_id: &str, command: &DeviceCommand) -> Result<CommandOutput, AgentError> {
        (**self).run(device_id, command).await
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub success: bool,
    /// Commands started, in order. The last one is the failing command on failure.
    pub attempted: Vec<DeviceCommand>,
    pub failure: Option<String>,
}

/// Runs the sequence in order and stops at the first failing device command.
///
/// Nothing is rolled back; `attempted` tells how far execution got.
pub async fn execute_commands<D>(channel: &D, sequence: &CommandSequence) -> ExecutionReport
where
    D: DeviceChannel + ?Sized,
{
    let device_id = sequence.device_id();
    let mut report = ExecutionReport {
        success: true,
        ..Default::default()
    };

    for command in sequence.commands() {
        report.attempted.push(command.clone());
        match command {
            DeviceCommand::Sleep { ms } => {
                tokio::time::sleep(std::time::Duration::from_millis(*ms)).await;
            }
            DeviceCommand::Noop { reason } => {
                info!(device = device_id, reason = %reason, "no device operation");
            }
            _ => {
                let failure = match channel.run(device_id, command).await {
                    Ok(out) if out.success() => None,
                    Ok(out) => Some(format!(
                        "exit status {}: {}",
                        out.status,
                        out.stderr.trim()
                    )),
                    Err(err) => Some(err.to_string()),
                };
                if let Some(failure) = failure {
                    warn!(device = device_id, command = ?command, error = %failure, "device command failed");
                    report.success = false;
                    report.failure = Some(failure);
                    return report;
                }
                debug!(device = device_id, command = ?command, "device command ok");
            }
        }
    }
    report
}

// ========================= ADB Transport =========================

#[derive(Clone, Debug)]
pub struct AdbDevice {
    adb: PathBuf,
}

impl Default for AdbDevice {
    fn default() -> Self {
        Self {
            adb: std::env::var_os("ADB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("adb")),
        }
    }
}

impl AdbDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(adb: impl Into<PathBuf>) -> Self {
        Self { adb: adb.into() }
    }

    async fn exec(&self, args: &[String]) -> Result<std::process::Output> {
        Command::new(&self.adb)
            .args(args)
            .output()
            .await
            .with_context(|| format!("spawn {} {}", self.adb.display(), args.join(" ")))
    }

    /// Serial numbers of attached devices in the `device` state.
    pub async fn list_devices(&self) -> Result<Vec<String>> {
        let out = self.exec(&["devices".to_string()]).await?;
        if !out.status.success() {
            bail!("adb devices failed: {}", String::from_utf8_lossy(&out.stderr).trim());
        }
        Ok(parse_device_list(&String::from_utf8_lossy(&out.stdout)))
    }

    /// Physical resolution, falling back to [`DEFAULT_SCREEN_SIZE`].
    pub async fn screen_size(&self, device_id: &str) -> (u32, u32) {
        let args = shell(device_id, ["wm", "size"]);
        match self.exec(&args).await {
            Ok(out) if out.status.success() => parse_wm_size(&String::from_utf8_lossy(&out.stdout))
                .unwrap_or(DEFAULT_SCREEN_SIZE),
            Ok(_) | Err(_) => {
                warn!(device = device_id, "could not read screen size, assuming default");
                DEFAULT_SCREEN_SIZE
            }
        }
    }

    pub async fn screencap(&self, device_id: &str) -> Result<Vec<u8>> {
        let args: Vec<String> = ["-s", device_id, "exec-out", "screencap", "-p"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let out = self.exec(&args).await?;
        if !out.status.success() {
            bail!("screencap failed: {}", String::from_utf8_lossy(&out.stderr).trim());
        }
        if out.stdout.is_empty() {
            bail!("screencap returned no data");
        }
        Ok(out.stdout)
    }
}

#[async_trait]
impl DeviceChannel for AdbDevice {
    async fn capture_screen(&self, device_id: &str) -> Result<Screenshot, AgentError> {
        let png = self
            .screencap(device_id)
            .await
            .map_err(|e| AgentError::Capture(format!("{e:#}")))?;
        Screenshot::from_png(png)
    }

    async fn run(&self, device_id: &str, command: &DeviceCommand) -> Result<CommandOutput, AgentError> {
        let Some(args) = adb_args(device_id, command) else {
            return Ok(CommandOutput::default());
        };
        let out = self
            .exec(&args)
            .await
            .map_err(|e| AgentError::Device(format!("{e:#}")))?;
        Ok(CommandOutput {
            status: out.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}

fn shell<'a>(device_id: &str, rest: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut args = vec!["-s".to_string(), device_id.to_string(), "shell".to_string()];
    args.extend(rest.into_iter().map(str::to_string));
    args
}

/// Single-quotes `raw` for the device shell.
fn quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// adb arguments for a device-bound command; `None` for local ones.
pub fn adb_args(device_id: &str, command: &DeviceCommand) -> Option<Vec<String>> {
    let args = match command {
        DeviceCommand::Tap { x, y } => {
            shell(device_id, ["input", "tap", x.to_string().as_str(), y.to_string().as_str()])
        }
        DeviceCommand::Swipe { x1, y1, x2, y2, duration_ms } => shell(
            device_id,
            [
                "input",
                "swipe",
                x1.to_string().as_str(),
                y1.to_string().as_str(),
                x2.to_string().as_str(),
                y2.to_string().as_str(),
                duration_ms.to_string().as_str(),
            ],
        ),
        // Requires the ADBKeyboard IME, which accepts non-ASCII text.
        DeviceCommand::TextInput { payload } => shell(
            device_id,
            ["am", "broadcast", "-a", "ADB_INPUT_TEXT", "--es", "msg", quote(payload).as_str()],
        ),
        DeviceCommand::KeyEvent { code } => shell(device_id, ["input", "keyevent", code.as_str()]),
        DeviceCommand::Sleep { .. } | DeviceCommand::Noop { .. } => return None,
    };
    Some(args)
}

fn parse_device_list(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|line| !line.starts_with("List of devices"))
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(serial), Some("device")) => Some(serial.to_string()),
                _ => None,
            }
        })
        .collect()
}

/// Parses `Physical size: 1080x1920`; an override size, when present, wins.
fn parse_wm_size(output: &str) -> Option<(u32, u32)> {
    let parse = |line: &str| -> Option<(u32, u32)> {
        let size = line.split_once(':').map_or(line, |(_, rest)| rest).trim();
        let (w, h) = size.split_once('x')?;
        Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
    };
    let mut physical = None;
    for line in output.lines() {
        if line.trim_start().starts_with("Override size") {
            if let Some(size) = parse(line) {
                return Some(size);
            }
        } else if physical.is_none() {
            physical = parse(line);
        }
    }
    physical
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::parse_action_output;
    use crate::command::synthesize;
    use std::io::Cursor;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingChannel {
        ran: Mutex<Vec<DeviceCommand>>,
        fail_on: Option<usize>,
    }

    #[async_trait]
    impl DeviceChannel for RecordingChannel {
        async fn capture_screen(&self, _device_id: &str) -> Result<Screenshot, AgentError> {
            Err(AgentError::Capture("not used".into()))
        }

        async fn run(&self, _device_id: &str, command: &DeviceCommand) -> Result<CommandOutput, AgentError> {
            let mut ran = self.ran.lock().unwrap();
            ran.push(command.clone());
            if Some(ran.len()) == self.fail_on {
                return Ok(CommandOutput { status: 1, stderr: "error: device offline".into() });
            }
            Ok(CommandOutput::default())
        }
    }

    fn sequence(text: &str) -> CommandSequence {
        let action = parse_action_output(text).record;
        let start = action
            .start_box
            .and_then(|b| crate::coords::map_box(&b, (1080, 1920)).ok());
        synthesize(&action, start.as_ref(), None, "emulator-5554")
    }

    #[tokio::test]
    async fn runs_device_commands_in_order_and_sleeps_locally() {
        let channel = RecordingChannel::default();
        let seq = sequence("Action: left_double(start_box='[100,200,300,400]')");
        let report = execute_commands(&channel, &seq).await;
        assert!(report.success);
        assert_eq!(report.attempted.len(), 3);
        assert_eq!(
            *channel.ran.lock().unwrap(),
            vec![DeviceCommand::Tap { x: 216, y: 576 }, DeviceCommand::Tap { x: 216, y: 576 }]
        );
    }

    #[tokio::test]
    async fn halts_at_first_failure() {
        let channel = RecordingChannel { fail_on: Some(1), ..Default::default() };
        let seq = sequence("Action: left_double(start_box='[100,200,300,400]')");
        let report = execute_commands(&channel, &seq).await;
        assert!(!report.success);
        assert_eq!(report.attempted, vec![DeviceCommand::Tap { x: 216, y: 576 }]);
        assert!(report.failure.unwrap().contains("device offline"));
        assert_eq!(channel.ran.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_sequence_succeeds() {
        let channel = RecordingChannel::default();
        let report = execute_commands(&channel, &sequence("no action here")).await;
        assert!(report.success);
        assert!(report.attempted.is_empty());
    }

    #[test]
    fn builds_adb_arguments() {
        assert_eq!(
            adb_args("dev", &DeviceCommand::Tap { x: 5, y: 7 }).unwrap(),
            ["-s", "dev", "shell", "input", "tap", "5", "7"]
        );
        assert_eq!(
            adb_args("dev", &DeviceCommand::TextInput { payload: "it's".into() }).unwrap()[9],
            r"'it'\''s'"
        );
        assert!(adb_args("dev", &DeviceCommand::Sleep { ms: 1 }).is_none());
    }

    #[test]
    fn parses_adb_output() {
        let devices = "List of devices attached\nemulator-5554\tdevice\nR58M\tunauthorized\n\n";
        assert_eq!(parse_device_list(devices), vec!["emulator-5554".to_string()]);
        assert_eq!(parse_wm_size("Physical size: 1080x2400\n"), Some((1080, 2400)));
        assert_eq!(
            parse_wm_size("Physical size: 1440x3040\nOverride size: 1080x2280\n"),
            Some((1080, 2280))
        );
        assert_eq!(parse_wm_size("garbage"), None);
    }

    #[test]
    fn screenshot_reads_dimensions() {
        let mut png = Vec::new();
        image::DynamicImage::ImageRgb8(image::RgbImage::new(4, 8))
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let shot = Screenshot::from_png(png).unwrap();
        assert_eq!(shot.size(), (4, 8));
        assert!(shot.to_data_url().starts_with("data:image/png;base64,"));
        assert!(Screenshot::from_png(b"not a png".to_vec()).is_err());
    }
}
