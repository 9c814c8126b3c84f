//! Hardware capability detection
//!
//! Probes the host for usable hardware encoders in a fixed priority order
//! (NVIDIA, Intel QSV, AMD VAAPI, Apple VideoToolbox) and falls back to the
//! software encoders. Every probe failure means "capability absent"; detection
//! itself never fails.

use crate::gpu_env::EnvMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::process::{Command, Stdio};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Encoder vendor class of the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareType {
    Nvidia,
    Intel,
    Amd,
    Apple,
    Cpu,
}

impl HardwareType {
    /// Encoder name suffix used by ffmpeg for this vendor
    pub fn encoder_suffix(&self) -> Option<&'static str> {
        match self {
            HardwareType::Nvidia => Some("nvenc"),
            HardwareType::Intel => Some("qsv"),
            HardwareType::Amd => Some("vaapi"),
            HardwareType::Apple => Some("videotoolbox"),
            HardwareType::Cpu => None,
        }
    }
}

impl std::fmt::Display for HardwareType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HardwareType::Nvidia => "nvidia",
            HardwareType::Intel => "intel",
            HardwareType::Amd => "amd",
            HardwareType::Apple => "apple",
            HardwareType::Cpu => "cpu",
        };
        f.write_str(name)
    }
}

/// Codec family an encoder produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecFamily {
    H264,
    Hevc,
    Av1,
}

impl CodecFamily {
    pub const ALL: [CodecFamily; 3] = [CodecFamily::H264, CodecFamily::Hevc, CodecFamily::Av1];

    /// Prefix of the vendor encoder names (`h264_nvenc`, `hevc_qsv`, ...)
    pub fn prefix(&self) -> &'static str {
        match self {
            CodecFamily::H264 => "h264",
            CodecFamily::Hevc => "hevc",
            CodecFamily::Av1 => "av1",
        }
    }

    /// Universal software encoder for the family
    pub fn software_encoder(&self) -> &'static str {
        match self {
            CodecFamily::H264 => "libx264",
            CodecFamily::Hevc => "libx265",
            CodecFamily::Av1 => "libaom-av1",
        }
    }
}

/// Detected encoder capabilities of the host. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareProfile {
    #[serde(rename = "type")]
    pub hw_type: HardwareType,
    pub available_encoders: BTreeMap<CodecFamily, String>,
}

impl HardwareProfile {
    /// The universal fallback: one software encoder per family
    pub fn cpu() -> Self {
        let available_encoders = CodecFamily::ALL
            .iter()
            .map(|family| (*family, family.software_encoder().to_string()))
            .collect();
        Self {
            hw_type: HardwareType::Cpu,
            available_encoders,
        }
    }

    pub fn is_hardware(&self) -> bool {
        self.hw_type != HardwareType::Cpu
    }

    /// Encoder for `family`, falling back to the software encoder when the
    /// detected vendor has none for it
    pub fn encoder_for(&self, family: CodecFamily) -> &str {
        self.available_encoders
            .get(&family)
            .map(String::as_str)
            .unwrap_or_else(|| family.software_encoder())
    }

    /// Whether `encoder` can be used on this host. Software encoders are
    /// always usable.
    pub fn supports(&self, encoder: &str) -> bool {
        CodecFamily::ALL
            .iter()
            .any(|family| family.software_encoder() == encoder)
            || self.available_encoders.values().any(|e| e == encoder)
    }
}

/// Result of running one probe command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Command exited successfully; carries its stdout
    Success(String),
    /// Missing binary, non-zero exit or unreadable output
    Unavailable,
}

/// Runs probe commands. Injected so detection is testable without the tools.
pub trait ProbeRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> ProbeOutcome;
}

impl<R: ProbeRunner + ?Sized> ProbeRunner for Arc<R> {
    fn run(&self, program: &str, args: &[&str]) -> ProbeOutcome {
        (**self).run(program, args)
    }
}

/// Probe runner backed by real subprocesses
#[derive(Debug, Clone)]
pub struct CommandProbeRunner {
    env: EnvMap,
}

impl CommandProbeRunner {
    /// `env` is the complete child environment (see [`crate::gpu_env::build_env`])
    pub fn new(env: EnvMap) -> Self {
        Self { env }
    }
}

impl ProbeRunner for CommandProbeRunner {
    fn run(&self, program: &str, args: &[&str]) -> ProbeOutcome {
        let output = Command::new(program)
            .args(args)
            .env_clear()
            .envs(&self.env)
            .stdin(Stdio::null())
            .output();

        match output {
            Ok(out) if out.status.success() => {
                ProbeOutcome::Success(String::from_utf8_lossy(&out.stdout).into_owned())
            }
            Ok(out) => {
                debug!(program, status = %out.status, "probe exited unsuccessfully");
                ProbeOutcome::Unavailable
            }
            Err(e) => {
                debug!(program, error = %e, "probe could not be started");
                ProbeOutcome::Unavailable
            }
        }
    }
}

/// Host operating system, as far as detection cares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    MacOs,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Other
        }
    }
}

/// Commands used for probing
#[derive(Debug, Clone)]
pub struct ProbeCommands {
    pub gpu_smi: String,
    pub ffmpeg: String,
}

impl Default for ProbeCommands {
    fn default() -> Self {
        Self {
            gpu_smi: "nvidia-smi".to_string(),
            ffmpeg: "ffmpeg".to_string(),
        }
    }
}

/// Vendors tried before the CPU fallback, highest priority first
const VENDOR_PRIORITY: [HardwareType; 4] = [
    HardwareType::Nvidia,
    HardwareType::Intel,
    HardwareType::Amd,
    HardwareType::Apple,
];

/// Probe outputs gathered from the host
#[derive(Debug, Clone)]
struct HostFacts {
    gpu_tool: ProbeOutcome,
    hwaccels: BTreeSet<String>,
    encoders: BTreeSet<String>,
}

pub struct HardwareDetector<R> {
    runner: R,
    commands: ProbeCommands,
    platform: Platform,
}

impl<R: ProbeRunner> HardwareDetector<R> {
    pub fn new(runner: R, commands: ProbeCommands) -> Self {
        Self::with_platform(runner, commands, Platform::current())
    }

    pub fn with_platform(runner: R, commands: ProbeCommands, platform: Platform) -> Self {
        Self {
            runner,
            commands,
            platform,
        }
    }

    /// Probe the host and build its profile. Never fails.
    pub fn detect(&self) -> HardwareProfile {
        let facts = self.gather();

        let profile = VENDOR_PRIORITY
            .iter()
            .find_map(|vendor| self.vendor_profile(*vendor, &facts))
            .unwrap_or_else(HardwareProfile::cpu);

        info!(
            hardware = %profile.hw_type,
            encoders = ?profile.available_encoders,
            "hardware detection finished"
        );
        profile
    }

    fn gather(&self) -> HostFacts {
        let gpu_tool = self.runner.run(&self.commands.gpu_smi, &[]);
        let hwaccels = match self
            .runner
            .run(&self.commands.ffmpeg, &["-hide_banner", "-hwaccels"])
        {
            ProbeOutcome::Success(out) => parse_hwaccels(&out),
            ProbeOutcome::Unavailable => BTreeSet::new(),
        };
        let encoders = match self
            .runner
            .run(&self.commands.ffmpeg, &["-hide_banner", "-encoders"])
        {
            ProbeOutcome::Success(out) => parse_encoder_tokens(&out),
            ProbeOutcome::Unavailable => BTreeSet::new(),
        };

        HostFacts {
            gpu_tool,
            hwaccels,
            encoders,
        }
    }

    fn vendor_profile(&self, vendor: HardwareType, facts: &HostFacts) -> Option<HardwareProfile> {
        let suffix = vendor.encoder_suffix()?;
        let available_encoders = vendor_encoders(suffix, &facts.encoders);

        let usable = match vendor {
            // the management utility answering is sufficient
            HardwareType::Nvidia => matches!(facts.gpu_tool, ProbeOutcome::Success(_)),
            HardwareType::Intel => facts.hwaccels.contains("qsv") && !available_encoders.is_empty(),
            HardwareType::Amd => facts.hwaccels.contains("vaapi") && !available_encoders.is_empty(),
            HardwareType::Apple => {
                self.platform == Platform::MacOs && !available_encoders.is_empty()
            }
            HardwareType::Cpu => false,
        };

        if !usable {
            debug!(vendor = %vendor, "vendor probe unavailable");
            return None;
        }

        Some(HardwareProfile {
            hw_type: vendor,
            available_encoders,
        })
    }
}

/// Encoder names advertised for `suffix`, per codec family
fn vendor_encoders(suffix: &str, advertised: &BTreeSet<String>) -> BTreeMap<CodecFamily, String> {
    CodecFamily::ALL
        .iter()
        .filter_map(|family| {
            let name = format!("{}_{}", family.prefix(), suffix);
            advertised.contains(&name).then_some((*family, name))
        })
        .collect()
}

/// Parse `ffmpeg -hwaccels` output into the set of method names
pub fn parse_hwaccels(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.ends_with(':'))
        .map(str::to_lowercase)
        .collect()
}

/// Collect every whitespace separated token of `ffmpeg -encoders` output.
///
/// Works for both the tabular listing (` V....D h264_nvenc  NVIDIA ...`) and a
/// bare one-name-per-line listing; callers look up exact encoder names.
pub fn parse_encoder_tokens(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .flat_map(str::split_whitespace)
        .map(str::to_string)
        .collect()
}

/// Process-wide cached profile.
///
/// Readers take a cheap `Arc` snapshot; re-detection builds a complete new
/// profile first and swaps it in, so readers never observe a partial one.
#[derive(Debug)]
pub struct SharedHardware {
    current: RwLock<Arc<HardwareProfile>>,
}

impl SharedHardware {
    pub fn new(profile: HardwareProfile) -> Self {
        Self {
            current: RwLock::new(Arc::new(profile)),
        }
    }

    pub fn snapshot(&self) -> Arc<HardwareProfile> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn publish(&self, profile: HardwareProfile) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(profile);
    }

    /// Run detection again and publish the result
    pub fn redetect<R: ProbeRunner>(&self, detector: &HardwareDetector<R>) -> Arc<HardwareProfile> {
        let profile = detector.detect();
        self.publish(profile);
        self.snapshot()
    }
}
