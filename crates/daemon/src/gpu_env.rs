//! Subprocess environment for encoder and probe invocations
//!
//! Encoders may be launched under a supervisor with a reduced inherited
//! environment, while GPU driver libraries are mounted late by the container
//! runtime or a virtualization layer (e.g. WSL2's `/usr/lib/wsl/lib`). The
//! builder defaults the NVIDIA visibility variables and appends the known
//! driver/CUDA directories to the search paths without clobbering them.

use std::collections::BTreeMap;

/// Environment passed to child processes, ordered for deterministic output
pub type EnvMap = BTreeMap<String, String>;

const VISIBILITY_DEFAULTS: &[(&str, &str)] = &[
    ("NVIDIA_VISIBLE_DEVICES", "all"),
    ("NVIDIA_DRIVER_CAPABILITIES", "compute,video,utility"),
];

/// Driver and CUDA runtime library directories, in search order
pub const GPU_LIBRARY_DIRS: &[&str] = &[
    "/usr/local/nvidia/lib64",
    "/usr/local/nvidia/lib",
    "/usr/local/cuda/lib64",
    "/usr/local/cuda/lib",
    "/usr/lib/wsl/lib",
    "/usr/lib/x86_64-linux-gnu",
];

/// CUDA tool directories (nvcc, nvidia-smi)
pub const GPU_BINARY_DIRS: &[&str] = &["/usr/local/cuda/bin", "/usr/local/nvidia/bin"];

/// Build the child environment from `base`.
///
/// Existing values always win: visibility variables are only defaulted when
/// absent, and search path entries already present are not repeated.
pub fn build_env(base: &EnvMap) -> EnvMap {
    let mut env = base.clone();

    for (key, value) in VISIBILITY_DEFAULTS {
        env.entry((*key).to_string())
            .or_insert_with(|| (*value).to_string());
    }

    append_search_path(&mut env, "LD_LIBRARY_PATH", GPU_LIBRARY_DIRS);
    append_search_path(&mut env, "PATH", GPU_BINARY_DIRS);

    env
}

/// [`build_env`] over the current process environment
pub fn current_gpu_env() -> EnvMap {
    let base: EnvMap = std::env::vars().collect();
    build_env(&base)
}

fn append_search_path(env: &mut EnvMap, key: &str, dirs: &[&str]) {
    let existing = env.get(key).cloned().unwrap_or_default();
    let mut entries: Vec<&str> = existing.split(':').filter(|p| !p.is_empty()).collect();

    for dir in dirs {
        if !entries.contains(dir) {
            entries.push(dir);
        }
    }

    let joined = entries.join(":");
    env.insert(key.to_string(), joined);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn env_of(pairs: &[(&str, &str)]) -> EnvMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_visibility_when_absent() {
        let env = build_env(&EnvMap::new());
        assert_eq!(env["NVIDIA_VISIBLE_DEVICES"], "all");
        assert_eq!(env["NVIDIA_DRIVER_CAPABILITIES"], "compute,video,utility");
    }

    #[test]
    fn test_keeps_existing_visibility() {
        let env = build_env(&env_of(&[("NVIDIA_VISIBLE_DEVICES", "1")]));
        assert_eq!(env["NVIDIA_VISIBLE_DEVICES"], "1");
    }

    #[test]
    fn test_appends_library_dirs_after_existing() {
        let env = build_env(&env_of(&[("LD_LIBRARY_PATH", "/opt/lib")]));
        let expected = format!("/opt/lib:{}", GPU_LIBRARY_DIRS.join(":"));
        assert_eq!(env["LD_LIBRARY_PATH"], expected);
    }

    #[test]
    fn test_empty_search_path_has_no_leading_separator() {
        let env = build_env(&EnvMap::new());
        assert_eq!(env["PATH"], "/usr/local/cuda/bin:/usr/local/nvidia/bin");
        assert!(!env["LD_LIBRARY_PATH"].starts_with(':'));
    }

    #[test]
    fn test_does_not_repeat_present_dirs() {
        let env = build_env(&env_of(&[("PATH", "/usr/bin:/usr/local/cuda/bin")]));
        assert_eq!(env["PATH"], "/usr/bin:/usr/local/cuda/bin:/usr/local/nvidia/bin");
    }

    #[test]
    fn test_unrelated_variables_pass_through() {
        let env = build_env(&env_of(&[("HOME", "/root"), ("LANG", "C.UTF-8")]));
        assert_eq!(env["HOME"], "/root");
        assert_eq!(env["LANG"], "C.UTF-8");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_existing_path_is_prefix(existing in "(/[a-z]{1,8}){1,3}(:(/[a-z]{1,8}){1,3}){0,3}") {
            let env = build_env(&env_of(&[("PATH", existing.as_str())]));
            prop_assert!(env["PATH"].starts_with(existing.as_str()));
            for dir in GPU_BINARY_DIRS {
                prop_assert!(env["PATH"].split(':').any(|p| p == *dir));
            }
        }

        #[test]
        fn prop_build_is_idempotent(existing in "(/[a-z]{1,8}){1,3}") {
            let once = build_env(&env_of(&[("LD_LIBRARY_PATH", existing.as_str())]));
            let twice = build_env(&once);
            prop_assert_eq!(once, twice);
        }
    }
}
