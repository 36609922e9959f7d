//! ffprobe metadata: duration, frame rate, and audio presence.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use anyhow::{anyhow, bail, Context, Result};

#[derive(serde::Deserialize, Debug)]
pub struct FfprobeOutput {
    streams: Vec<FfprobeStream>,
    format: FfprobeFormat,
}

#[derive(serde::Deserialize, Debug)]
struct FfprobeStream {
    index: usize,
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    #[serde(default)]
    disposition: HashMap<String, serde_json::Value>,
}

#[derive(serde::Deserialize, Debug)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    /// Frame rate as a rational string, passed straight to the encoder.
    pub fps: String,
    pub fps_value: f64,
    pub duration_secs: f64,
    pub has_audio: bool,
}

pub fn probe(path: &Path) -> Result<VideoInfo> {
    let output = crate::runtime::command_for("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("failed to execute ffprobe — is FFmpeg installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        );
    }

    parse_probe_json(&output.stdout)
}

pub fn parse_probe_json(json: &[u8]) -> Result<VideoInfo> {
    let probe: FfprobeOutput =
        serde_json::from_slice(json).context("failed to parse ffprobe JSON output")?;

    let video = select_primary_video_stream(&probe.streams)
        .ok_or_else(|| anyhow!("no video stream found"))?;

    let width = video.width.ok_or_else(|| anyhow!("video stream missing width"))?;
    let height = video
        .height
        .ok_or_else(|| anyhow!("video stream missing height"))?;

    let fps_str = video
        .r_frame_rate
        .as_deref()
        .or(video.avg_frame_rate.as_deref())
        .unwrap_or("0/0");
    let fps_value = parse_frame_rate(fps_str).unwrap_or(0.0);
    let (fps, fps_value) = if fps_value > 0.0 {
        (fps_str.to_string(), fps_value)
    } else {
        ("24000/1001".to_string(), 23.976)
    };

    let duration_secs = probe
        .format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    let has_audio = probe
        .streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    Ok(VideoInfo {
        width,
        height,
        fps,
        fps_value,
        duration_secs,
        has_audio,
    })
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    let parts: Vec<&str> = s.split('/').collect();
    if parts.len() == 2 {
        let num: f64 = parts[0].parse().ok()?;
        let den: f64 = parts[1].parse().ok()?;
        if den > 0.0 {
            return Some(num / den);
        }
    }
    s.parse().ok()
}

fn disposition_flag(stream: &FfprobeStream, key: &str) -> bool {
    stream
        .disposition
        .get(key)
        .and_then(|value| {
            value
                .as_bool()
                .or_else(|| value.as_i64().map(|n| n != 0))
                .or_else(|| value.as_str().map(|s| s != "0"))
        })
        .unwrap_or(false)
}

/// Prefer real video over attached pictures, then default streams, then
/// the lowest index.
fn select_primary_video_stream(streams: &[FfprobeStream]) -> Option<&FfprobeStream> {
    streams
        .iter()
        .filter(|stream| stream.codec_type.as_deref() == Some("video"))
        .min_by_key(|stream| {
            let is_attached_picture = disposition_flag(stream, "attached_pic");
            let is_default = disposition_flag(stream, "default");
            (is_attached_picture, !is_default, stream.index)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROBE_JSON: &str = r#"{
        "streams": [
            {"index": 0, "codec_type": "video", "width": 1920, "height": 1080,
             "r_frame_rate": "24000/1001", "disposition": {"default": 1}},
            {"index": 1, "codec_type": "audio", "disposition": {}}
        ],
        "format": {"duration": "12.5"}
    }"#;

    #[test]
    fn test_parse_probe_json() {
        let info = parse_probe_json(PROBE_JSON.as_bytes()).unwrap();
        assert_eq!((info.width, info.height), (1920, 1080));
        assert_eq!(info.fps, "24000/1001");
        assert!((info.fps_value - 23.976).abs() < 0.001);
        assert!((info.duration_secs - 12.5).abs() < 1e-9);
        assert!(info.has_audio);
    }

    #[test]
    fn test_parse_probe_without_audio() {
        let json = r#"{
            "streams": [{"index": 0, "codec_type": "video", "width": 640,
                         "height": 480, "r_frame_rate": "24/1", "disposition": {}}],
            "format": {}
        }"#;
        let info = parse_probe_json(json.as_bytes()).unwrap();
        assert!(!info.has_audio);
        assert_eq!(info.duration_secs, 0.0);
        assert!((info.fps_value - 24.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_probe_no_video_stream() {
        let json = r#"{"streams": [{"index": 0, "codec_type": "audio", "disposition": {}}], "format": {}}"#;
        assert!(parse_probe_json(json.as_bytes()).is_err());
    }

    #[test]
    fn test_parse_frame_rate_forms() {
        assert_eq!(parse_frame_rate("24/1"), Some(24.0));
        assert_eq!(parse_frame_rate("30"), Some(30.0));
        assert_eq!(parse_frame_rate("0/0"), None);
    }

    #[test]
    fn test_attached_picture_is_not_primary() {
        let json = r#"{
            "streams": [
                {"index": 0, "codec_type": "video", "width": 600, "height": 600,
                 "disposition": {"attached_pic": 1}},
                {"index": 1, "codec_type": "video", "width": 1280, "height": 720,
                 "r_frame_rate": "24/1", "disposition": {}}
            ],
            "format": {"duration": "1.0"}
        }"#;
        let info = parse_probe_json(json.as_bytes()).unwrap();
        assert_eq!(info.width, 1280);
    }
}
