//! Startup checks
//!
//! Verifies before the daemon starts that the configured ffmpeg and ffprobe
//! binaries execute. The parsed ffmpeg version is logged.

use crate::config::Config;
use crate::gpu_env::EnvMap;
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{info, warn};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run `<program> -version` and return its stdout
fn run_version(program: &str, env: &EnvMap) -> Result<String, StartupError> {
    let output = Command::new(program)
        .arg("-version")
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| StartupError::ToolUnavailable {
            tool: program.to_string(),
            reason: format!("{} -version failed; is it installed and in PATH? Error: {}", program, e),
        })?;

    if !output.status.success() {
        return Err(StartupError::ToolUnavailable {
            tool: program.to_string(),
            reason: format!("{} -version exited with {}", program, output.status),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 8.0 ..."
/// - N-prefixed: "ffmpeg version n8.0-... ..."
/// - ffprobe: "ffprobe version 7.1 ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_part = version_output.lines().find_map(|line| {
        let lower = line.to_lowercase();
        let rest = lower
            .split_once("ffmpeg version")
            .or_else(|| lower.split_once("ffprobe version"))?
            .1
            .to_string();
        rest.split_whitespace().next().map(str::to_string)
    })?;

    // Handle n-prefixed versions (e.g., "n8.0-...")
    let version_str = version_part.trim_start_matches('n');

    let major_str = version_str.split(['.', '-']).next()?;
    major_str.parse().ok()
}

/// Check that a tool runs and return its major version when parseable
pub fn check_tool(program: &str, env: &EnvMap) -> Result<Option<u32>, StartupError> {
    let output = run_version(program, env)?;
    let major = parse_ffmpeg_version(&output);
    match major {
        Some(major) => info!(tool = program, major, "Tool available"),
        None => warn!(
            tool = program,
            first_line = output.lines().next().unwrap_or("(empty)"),
            "Tool available but version not recognised"
        ),
    }
    Ok(major)
}

/// Run all startup checks in order: ffmpeg, then ffprobe
pub fn run_startup_checks(cfg: &Config, env: &EnvMap) -> Result<(), StartupError> {
    check_tool(&cfg.tools.ffmpeg, env)?;
    check_tool(&cfg.tools.ffprobe, env)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_ffmpeg_version_parsing_standard(
            major in 1u32..20,
            minor in 0u32..10,
            patch in 0u32..10,
        ) {
            let version_output = format!(
                "ffmpeg version {}.{}.{} Copyright (c) 2000-2024 the FFmpeg developers",
                major, minor, patch
            );
            prop_assert_eq!(parse_ffmpeg_version(&version_output), Some(major));
        }

        #[test]
        fn prop_ffmpeg_version_parsing_n_prefixed(
            major in 1u32..20,
            minor in 0u32..10,
            git_hash in "[a-f0-9]{7}",
        ) {
            let version_output = format!(
                "ffmpeg version n{}.{}-123-g{} Copyright (c) 2000-2024",
                major, minor, git_hash
            );
            prop_assert_eq!(parse_ffmpeg_version(&version_output), Some(major));
        }

        #[test]
        fn prop_ffprobe_version_parsing(major in 1u32..20, minor in 0u32..10) {
            let version_output = format!(
                "ffprobe version {}.{} Copyright (c) 2007-2024\nbuilt with gcc 12.2.0",
                major, minor
            );
            prop_assert_eq!(parse_ffmpeg_version(&version_output), Some(major));
        }
    }

    #[test]
    fn test_parse_ffmpeg_version_multiline() {
        let output = r#"ffmpeg version n8.0-5-g1234567 Copyright (c) 2000-2024
built with gcc 12.2.0
configuration: --enable-gpl"#;
        assert_eq!(parse_ffmpeg_version(output), Some(8));
    }

    #[test]
    fn test_parse_ffmpeg_version_git_build() {
        // Nightly builds have no numeric version
        assert_eq!(parse_ffmpeg_version("ffmpeg version N-112345-gabcdef"), None);
    }

    #[test]
    fn test_parse_ffmpeg_version_invalid() {
        assert_eq!(parse_ffmpeg_version("not ffmpeg output"), None);
        assert_eq!(parse_ffmpeg_version(""), None);
    }

    #[test]
    fn test_missing_tool_is_unavailable() {
        let env: EnvMap = std::env::vars().collect();
        let result = check_tool("/nonexistent/ffmpeg-sizecap", &env);
        assert!(matches!(result, Err(StartupError::ToolUnavailable { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_tool_is_unavailable() {
        let env: EnvMap = std::env::vars().collect();
        let result = check_tool("false", &env);
        assert!(matches!(result, Err(StartupError::ToolUnavailable { .. })));
    }
}
