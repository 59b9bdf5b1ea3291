//! Helpers para invocar yt-dlp / ffprobe / ffmpeg.

use serde::de::DeserializeOwned;
use std::{process::Stdio, time::Duration};
use tracing::debug;

use super::AudioStream;

/// Ejecuta un programa y devuelve su stdout, o stderr como error
pub async fn run_text(program: &str, args: &[&str]) -> Result<String, String> {
    debug!("⚙️ {} {}", program, args.join(" "));

    let output = async_process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| format!("{} process error: {}", program, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("{} failed: {}", program, stderr.trim()));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Ejecuta un programa cuya salida es JSON y la deserializa
pub async fn run_json<T: DeserializeOwned>(program: &str, args: &[&str]) -> Result<T, String> {
    let stdout = run_text(program, args).await?;
    serde_json::from_str(&stdout).map_err(|e| format!("invalid {} output: {}", program, e))
}

/// Lanza ffmpeg empezando en `seek` y devuelve su stdout (mp3) como stream
pub fn ffmpeg_seek(ffmpeg: &str, input: &str, seek: Duration) -> std::io::Result<AudioStream> {
    let seek = format!("{:.3}", seek.as_secs_f64());
    debug!("⏩ ffmpeg -ss {} -i {}", seek, input);

    let child = std::process::Command::new(ffmpeg)
        .args(ffmpeg_seek_args(input, &seek))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    Ok(AudioStream::Process(child))
}

#[rustfmt::skip]
fn ffmpeg_seek_args<'a>(input: &'a str, seek: &'a str) -> [&'a str; 18] {
    [
        "-ss", seek,
        "-fflags", "nobuffer",
        "-probesize", "32",
        "-analyzeduration", "0",
        "-i", input,
        "-vn",
        "-f", "mp3",
        "-strict", "-2",
        "-loglevel", "error",
        "pipe:1",
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seek_is_applied_before_input() {
        let args = ffmpeg_seek_args("https://cdn.test/a.mp3", "30.000");
        let ss = args.iter().position(|a| *a == "-ss").unwrap();
        let input = args.iter().position(|a| *a == "-i").unwrap();
        assert!(ss < input);
        assert_eq!(args[ss + 1], "30.000");
        assert_eq!(args[input + 1], "https://cdn.test/a.mp3");
        assert_eq!(args.last(), Some(&"pipe:1"));
    }

    #[tokio::test]
    async fn missing_program_reports_error() {
        let result = run_text("definitely-not-a-real-program-open-music", &["--version"]).await;
        assert!(result.is_err());
    }
}
