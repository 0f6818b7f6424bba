//! Encoders that turn the ordered export frames into output files.

use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};

use image::RgbaImage;
use serde::Serialize;

use lockstep_common::{ExportFormat, ExportSettings, LockstepError, LockstepResult};

/// Geometry and destination of one encode.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeSpec {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    /// Container file, or directory for image sequences.
    pub output: PathBuf,
}

/// A finished encode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncodedOutput {
    pub path: PathBuf,
    pub frames: u64,
    pub bytes: u64,
    pub container: String,
}

/// Consumes frames in order. `begin` is called once before the first frame;
/// either `finish` or `abort` ends the encode.
///
/// Every method may block on file or pipe I/O. The exporter calls them
/// through [`run_blocking`], so implementations can block freely.
pub trait VideoEncoder: Send {
    fn name(&self) -> &str;

    fn begin(&mut self, spec: &EncodeSpec) -> LockstepResult<()>;

    fn push_frame(&mut self, frame: &RgbaImage) -> LockstepResult<()>;

    /// Close the stream and mux `audio`, when given, into the output.
    fn finish(&mut self, audio: Option<&Path>) -> LockstepResult<EncodedOutput>;

    /// Stop encoding and remove partial output.
    fn abort(&mut self);
}

/// Run a blocking encoder call from async code.
///
/// On a multi-threaded runtime the worker is handed off for the duration so
/// other tasks (the clock coordinator, signal handlers) keep running. On a
/// current-thread runtime, or outside any runtime, `f` runs in place.
pub fn run_blocking<T>(f: impl FnOnce() -> T) -> T {
    use tokio::runtime::{Handle, RuntimeFlavor};

    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// Encoder for `settings.format`.
pub fn encoder_for(settings: &ExportSettings) -> Box<dyn VideoEncoder> {
    match settings.format {
        ExportFormat::PngSequence => Box::new(PngSequenceEncoder::new()),
        format => Box::new(FfmpegEncoder::new(format, settings.video_bitrate_kbps)),
    }
}

pub fn command_exists(binary: &str) -> bool {
    Command::new("sh")
        .arg("-c")
        .arg(format!("command -v {binary} >/dev/null 2>&1"))
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn check_frame(spec: &EncodeSpec, frame: &RgbaImage, index: u64) -> LockstepResult<()> {
    if frame.dimensions() != (spec.width, spec.height) {
        return Err(LockstepError::encode(format!(
            "frame {index} is {}x{}, expected {}x{}",
            frame.width(),
            frame.height(),
            spec.width,
            spec.height
        )));
    }
    Ok(())
}

fn ensure_parent_dir(path: &Path) -> LockstepResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

// ---- ffmpeg -------------------------------------------------------------------

fn codec_args(format: ExportFormat, video_bitrate_kbps: u32) -> Vec<String> {
    let video_bitrate = format!("{}k", video_bitrate_kbps.max(500));
    match format {
        ExportFormat::Mp4H264 => vec![
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            "medium".to_string(),
            "-profile:v".to_string(),
            "high".to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-b:v".to_string(),
            video_bitrate,
            "-movflags".to_string(),
            "+faststart".to_string(),
        ],
        // Alpha survives only with yuva420p and alt-ref frames disabled.
        ExportFormat::WebmVp9 | ExportFormat::PngSequence => vec![
            "-c:v".to_string(),
            "libvpx-vp9".to_string(),
            "-pix_fmt".to_string(),
            "yuva420p".to_string(),
            "-auto-alt-ref".to_string(),
            "0".to_string(),
            "-b:v".to_string(),
            video_bitrate,
        ],
    }
}

/// Audio codec arguments: stream copy when the track already suits the
/// container, otherwise a transcode.
fn audio_args(format: ExportFormat, audio: &Path) -> Vec<String> {
    let ext = audio
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    let copyable = match format {
        ExportFormat::Mp4H264 => matches!(ext.as_str(), "m4a" | "aac" | "mp4"),
        _ => matches!(ext.as_str(), "opus" | "webm" | "ogg"),
    };
    if copyable {
        return vec!["-c:a".to_string(), "copy".to_string()];
    }
    match format {
        ExportFormat::Mp4H264 => vec![
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            "192k".to_string(),
        ],
        _ => vec![
            "-c:a".to_string(),
            "libopus".to_string(),
            "-b:a".to_string(),
            "128k".to_string(),
        ],
    }
}

/// Video-only intermediate written next to the output, e.g. `out.video.webm`.
fn intermediate_path(output: &Path, format: ExportFormat) -> PathBuf {
    let stem = output
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("lockstep");
    output.with_file_name(format!("{stem}.video.{}", format.extension()))
}

struct FfmpegSession {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_task: Option<std::thread::JoinHandle<String>>,
    spec: EncodeSpec,
    video_path: PathBuf,
    frames: u64,
}

impl FfmpegSession {
    fn collect_stderr(&mut self) -> String {
        self.stderr_task
            .take()
            .map(|task| {
                task.join()
                    .unwrap_or_else(|_| "<failed to join stderr reader>".to_string())
            })
            .unwrap_or_default()
    }
}

/// Raw RGBA frames piped into an `ffmpeg` child process.
pub struct FfmpegEncoder {
    format: ExportFormat,
    video_bitrate_kbps: u32,
    binary: String,
    session: Option<FfmpegSession>,
}

impl FfmpegEncoder {
    pub fn new(format: ExportFormat, video_bitrate_kbps: u32) -> Self {
        Self {
            format,
            video_bitrate_kbps,
            binary: "ffmpeg".to_string(),
            session: None,
        }
    }

    /// Use a different ffmpeg executable.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn is_available(&self) -> bool {
        command_exists(&self.binary)
    }

    fn input_args(spec: &EncodeSpec) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-f".to_string(),
            "rawvideo".to_string(),
            "-pix_fmt".to_string(),
            "rgba".to_string(),
            "-s".to_string(),
            format!("{}x{}", spec.width, spec.height),
            "-r".to_string(),
            spec.frame_rate.to_string(),
            "-i".to_string(),
            "-".to_string(),
        ]
    }

    fn mux_audio(&self, session: &FfmpegSession, audio: &Path) -> LockstepResult<()> {
        let mut args = vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            session.video_path.display().to_string(),
            "-i".to_string(),
            audio.display().to_string(),
            "-map".to_string(),
            "0:v:0".to_string(),
            "-map".to_string(),
            "1:a:0".to_string(),
            "-c:v".to_string(),
            "copy".to_string(),
        ];
        args.extend(audio_args(self.format, audio));
        args.push("-shortest".to_string());
        args.push(session.spec.output.display().to_string());

        tracing::debug!(args = ?args, "Muxing audio");
        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| LockstepError::encode(format!("Failed to start ffmpeg: {e}")))?;
        if !output.status.success() {
            return Err(LockstepError::encode(format!(
                "ffmpeg audio mux failed (status {}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn begin(&mut self, spec: &EncodeSpec) -> LockstepResult<()> {
        if self.session.is_some() {
            return Err(LockstepError::encode("encode already in progress"));
        }
        if spec.width == 0 || spec.height == 0 {
            return Err(LockstepError::encode("output size must be non-zero"));
        }
        if spec.width % 2 != 0 || spec.height % 2 != 0 {
            return Err(LockstepError::encode(format!(
                "{}x{} is not encodable with 4:2:0 chroma; use even dimensions",
                spec.width, spec.height
            )));
        }
        ensure_parent_dir(&spec.output)?;

        let video_path = intermediate_path(&spec.output, self.format);
        let mut args = Self::input_args(spec);
        args.extend(codec_args(self.format, self.video_bitrate_kbps));
        args.push(video_path.display().to_string());

        tracing::debug!(args = ?args, "Running ffmpeg");
        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| LockstepError::encode(format!("Failed to start ffmpeg: {e}")))?;

        tracing::info!(
            pid = child.id(),
            width = spec.width,
            height = spec.height,
            frame_rate = spec.frame_rate,
            output = %spec.output.display(),
            "ffmpeg process started"
        );

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LockstepError::encode("Failed to capture ffmpeg stdin"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| LockstepError::encode("Failed to capture ffmpeg stderr"))?;

        // Drain stderr concurrently so ffmpeg never blocks on a full pipe.
        let stderr_task = std::thread::spawn(move || -> String {
            let mut reader = BufReader::new(stderr);
            let mut output = String::new();
            match reader.read_to_string(&mut output) {
                Ok(_) => output,
                Err(err) => format!("<failed to read ffmpeg stderr: {err}>"),
            }
        });

        self.session = Some(FfmpegSession {
            child,
            stdin: Some(stdin),
            stderr_task: Some(stderr_task),
            spec: spec.clone(),
            video_path,
            frames: 0,
        });
        Ok(())
    }

    fn push_frame(&mut self, frame: &RgbaImage) -> LockstepResult<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| LockstepError::encode("push_frame before begin"))?;
        check_frame(&session.spec, frame, session.frames)?;
        let stdin = session
            .stdin
            .as_mut()
            .ok_or_else(|| LockstepError::encode("ffmpeg stdin already closed"))?;
        if let Err(e) = stdin.write_all(frame.as_raw()) {
            let index = session.frames;
            session.stdin = None;
            let _ = session.child.wait();
            let stderr = session.collect_stderr();
            return Err(LockstepError::encode(format!(
                "failed to write frame {index} to ffmpeg: {e}: {}",
                stderr.trim()
            )));
        }
        session.frames += 1;
        Ok(())
    }

    fn finish(&mut self, audio: Option<&Path>) -> LockstepResult<EncodedOutput> {
        let mut session = self
            .session
            .take()
            .ok_or_else(|| LockstepError::encode("finish before begin"))?;

        // Closing stdin ends the stream.
        session.stdin = None;
        let status = session
            .child
            .wait()
            .map_err(|e| LockstepError::encode(format!("Failed to wait on ffmpeg: {e}")))?;
        let stderr_output = session.collect_stderr();
        if !status.success() {
            let _ = std::fs::remove_file(&session.video_path);
            return Err(LockstepError::encode(format!(
                "ffmpeg export failed (status {}): {}",
                status,
                stderr_output.trim()
            )));
        }

        match audio {
            Some(audio) => {
                let muxed = self.mux_audio(&session, audio);
                let _ = std::fs::remove_file(&session.video_path);
                muxed?;
            }
            None => std::fs::rename(&session.video_path, &session.spec.output)?,
        }

        let bytes = std::fs::metadata(&session.spec.output)?.len();
        tracing::info!(
            output = %session.spec.output.display(),
            frames = session.frames,
            bytes,
            with_audio = audio.is_some(),
            "ffmpeg export complete"
        );
        Ok(EncodedOutput {
            path: session.spec.output.clone(),
            frames: session.frames,
            bytes,
            container: self.format.extension().to_string(),
        })
    }

    fn abort(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        session.stdin = None;
        if let Err(e) = session.child.kill() {
            tracing::debug!(error = %e, "ffmpeg already exited");
        }
        let _ = session.child.wait();
        session.collect_stderr();
        for path in [&session.video_path, &session.spec.output] {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial output");
                }
            }
        }
        tracing::info!(frames = session.frames, "ffmpeg export aborted");
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        self.abort();
    }
}

// ---- png sequence -------------------------------------------------------------

/// Numbered PNG files (`frame_000000.png`, ...) in the output directory.
#[derive(Debug, Default)]
pub struct PngSequenceEncoder {
    spec: Option<EncodeSpec>,
    written: Vec<PathBuf>,
    bytes: u64,
}

impl PngSequenceEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame_path(dir: &Path, index: u64) -> PathBuf {
        dir.join(format!("frame_{index:06}.png"))
    }
}

impl VideoEncoder for PngSequenceEncoder {
    fn name(&self) -> &str {
        "png-sequence"
    }

    fn begin(&mut self, spec: &EncodeSpec) -> LockstepResult<()> {
        if spec.width == 0 || spec.height == 0 {
            return Err(LockstepError::encode("output size must be non-zero"));
        }
        std::fs::create_dir_all(&spec.output)?;
        self.spec = Some(spec.clone());
        self.written.clear();
        self.bytes = 0;
        tracing::info!(dir = %spec.output.display(), "Writing PNG sequence");
        Ok(())
    }

    fn push_frame(&mut self, frame: &RgbaImage) -> LockstepResult<()> {
        let spec = self
            .spec
            .as_ref()
            .ok_or_else(|| LockstepError::encode("push_frame before begin"))?;
        let index = self.written.len() as u64;
        check_frame(spec, frame, index)?;

        let path = Self::frame_path(&spec.output, index);
        frame
            .save(&path)
            .map_err(|e| LockstepError::encode(format!("failed to write {}: {e}", path.display())))?;
        self.bytes += std::fs::metadata(&path)?.len();
        self.written.push(path);
        Ok(())
    }

    fn finish(&mut self, audio: Option<&Path>) -> LockstepResult<EncodedOutput> {
        let spec = self
            .spec
            .take()
            .ok_or_else(|| LockstepError::encode("finish before begin"))?;

        if let Some(audio) = audio {
            if let Some(name) = audio.file_name() {
                let target = spec.output.join(name);
                self.bytes += std::fs::copy(audio, &target)?;
                self.written.push(target);
            }
        }

        let frames = self
            .written
            .iter()
            .filter(|p| p.extension().is_some_and(|e| e == "png"))
            .count() as u64;
        tracing::info!(dir = %spec.output.display(), frames, bytes = self.bytes, "PNG sequence complete");
        self.written.clear();
        Ok(EncodedOutput {
            path: spec.output,
            frames,
            bytes: self.bytes,
            container: "png".to_string(),
        })
    }

    fn abort(&mut self) {
        if self.spec.take().is_none() {
            return;
        }
        for path in self.written.drain(..) {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial frame");
            }
        }
        self.bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn spec(output: PathBuf) -> EncodeSpec {
        EncodeSpec {
            width: 4,
            height: 2,
            frame_rate: 30.0,
            output,
        }
    }

    #[test]
    fn test_run_blocking_outside_runtime_runs_in_place() {
        assert_eq!(run_blocking(|| 7), 7);
    }

    #[tokio::test]
    async fn test_run_blocking_on_current_thread_runtime() {
        let id = std::thread::current().id();
        assert_eq!(run_blocking(|| std::thread::current().id()), id);
    }

    #[test]
    fn test_webm_keeps_alpha() {
        let args = codec_args(ExportFormat::WebmVp9, 8_000);
        let joined = args.join(" ");
        assert!(joined.contains("libvpx-vp9"));
        assert!(joined.contains("-pix_fmt yuva420p"));
        assert!(joined.contains("-auto-alt-ref 0"));
        assert!(joined.contains("-b:v 8000k"));
    }

    #[test]
    fn test_mp4_uses_h264() {
        let joined = codec_args(ExportFormat::Mp4H264, 100).join(" ");
        assert!(joined.contains("libx264"));
        assert!(joined.contains("yuv420p"));
        assert!(joined.contains("-b:v 500k"));
    }

    #[test]
    fn test_audio_copy_when_compatible() {
        assert_eq!(
            audio_args(ExportFormat::WebmVp9, Path::new("a.opus")),
            vec!["-c:a", "copy"]
        );
        assert_eq!(
            audio_args(ExportFormat::Mp4H264, Path::new("a.M4A")),
            vec!["-c:a", "copy"]
        );
        assert_eq!(audio_args(ExportFormat::Mp4H264, Path::new("a.wav"))[1], "aac");
        assert_eq!(audio_args(ExportFormat::WebmVp9, Path::new("a.wav"))[1], "libopus");
    }

    #[test]
    fn test_intermediate_path() {
        assert_eq!(
            intermediate_path(Path::new("/tmp/out/final.webm"), ExportFormat::WebmVp9),
            PathBuf::from("/tmp/out/final.video.webm")
        );
    }

    #[test]
    fn test_ffmpeg_rejects_odd_dimensions() {
        let mut encoder = FfmpegEncoder::new(ExportFormat::Mp4H264, 4_000);
        let odd = EncodeSpec {
            width: 5,
            ..spec(std::env::temp_dir().join("lockstep_odd.mp4"))
        };
        assert!(matches!(encoder.begin(&odd), Err(LockstepError::Encode { .. })));
    }

    #[test]
    fn test_png_sequence_writes_numbered_frames() {
        let dir = std::env::temp_dir().join("lockstep_test_png_sequence");
        let _ = std::fs::remove_dir_all(&dir);

        let mut encoder = PngSequenceEncoder::new();
        encoder.begin(&spec(dir.clone())).unwrap();
        for v in [10u8, 20, 30] {
            encoder
                .push_frame(&RgbaImage::from_pixel(4, 2, Rgba([v, v, v, 255])))
                .unwrap();
        }
        let output = encoder.finish(None).unwrap();

        assert_eq!(output.frames, 3);
        assert_eq!(output.container, "png");
        assert!(output.bytes > 0);
        let second = image::open(PngSequenceEncoder::frame_path(&dir, 1))
            .unwrap()
            .to_rgba8();
        assert_eq!(second.get_pixel(0, 0).0, [20, 20, 20, 255]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_png_sequence_rejects_wrong_size_and_abort_cleans_up() {
        let dir = std::env::temp_dir().join("lockstep_test_png_abort");
        let _ = std::fs::remove_dir_all(&dir);

        let mut encoder = PngSequenceEncoder::new();
        encoder.begin(&spec(dir.clone())).unwrap();
        encoder.push_frame(&RgbaImage::new(4, 2)).unwrap();
        assert!(encoder.push_frame(&RgbaImage::new(3, 2)).is_err());
        encoder.abort();

        assert!(!PngSequenceEncoder::frame_path(&dir, 0).exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
