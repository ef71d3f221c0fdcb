use std::collections::BTreeMap;
use std::env;
use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::OsStrExt;

use anyhow::{Context, Result};

use tracemap::constants::MSAN_ERROR;
use tracemap::TraceMap;

use crate::config::Config;
use crate::transform::ArgvTransform;

const ASAN_OPTIONS: &str = "abort_on_error=1:detect_leaks=0:symbolize=0:allocator_may_return_null=1";

fn msan_options() -> String {
    format!(
        "exit_code={}:symbolize=0:abort_on_error=1:allocator_may_return_null=1:msan_track_origins=0",
        MSAN_ERROR
    )
}

/// Environment handed to the target at exec time.
///
/// Built once in the parent so the forked child only has to pass a ready-made
/// `envp` to `execve(2)`.
#[derive(Debug, Clone, Default)]
pub struct TargetEnv {
    vars: BTreeMap<OsString, OsString>,
}

impl TargetEnv {
    /// Start from our own environment
    pub fn inherit() -> Self {
        Self {
            vars: env::vars_os().collect(),
        }
    }

    /// Everything the target needs on top of `base`: the map handle, sanitizer
    /// settings, eager binding and library preloads.
    pub fn prepare(
        base: Self,
        config: &Config,
        map: &TraceMap,
        transform: &dyn ArgvTransform,
    ) -> Self {
        let mut env = base;

        if let Some((name, value)) = map.export_handle() {
            env.set(name, value);
        }

        env.set_default("ASAN_OPTIONS", ASAN_OPTIONS);
        env.set_default("MSAN_OPTIONS", msan_options());

        if !config.bind_lazy {
            env.set_default("LD_BIND_NOW", "1");
        }

        if let Some(preload) = &config.preload {
            match transform.env_forward_var() {
                Some(var) => {
                    let merged = match env.get(var) {
                        Some(existing) => format!(
                            "{},LD_PRELOAD={}",
                            existing.to_string_lossy(),
                            preload
                        ),
                        None => format!("LD_PRELOAD={}", preload),
                    };
                    env.set(var, merged);
                }
                None => {
                    env.set("LD_PRELOAD", preload);
                    env.set("DYLD_INSERT_LIBRARIES", preload);
                }
            }
        }

        env
    }

    pub fn set<K: Into<OsString>, V: Into<OsString>>(&mut self, key: K, value: V) {
        self.vars.insert(key.into(), value.into());
    }

    /// Set unless the user already did
    pub fn set_default<K: Into<OsString>, V: Into<OsString>>(&mut self, key: K, value: V) {
        self.vars.entry(key.into()).or_insert_with(|| value.into());
    }

    pub fn get<K: AsRef<OsStr>>(&self, key: K) -> Option<&OsStr> {
        self.vars.get(key.as_ref()).map(|v| v.as_os_str())
    }

    /// `KEY=VALUE` strings for `execve(2)`
    pub fn to_envp(&self) -> Result<Vec<CString>> {
        self.vars
            .iter()
            .map(|(k, v)| {
                let mut entry = k.as_bytes().to_vec();
                entry.push(b'=');
                entry.extend_from_slice(v.as_bytes());
                CString::new(entry)
                    .with_context(|| format!("Environment variable {:?} contains NUL", k))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{Native, QemuTrace};
    use std::path::PathBuf;
    use tracemap::constants::SHM_ENV_VAR;

    fn config() -> Config {
        Config::new(vec!["/bin/true".to_string()], PathBuf::from("out"))
    }

    #[test]
    fn test_defaults_and_handle() {
        let map = TraceMap::create(1024).expect("failed to create shm");
        let mut base = TargetEnv::default();
        base.set("ASAN_OPTIONS", "user_choice=1");

        let env = TargetEnv::prepare(base, &config(), &map, &Native);

        let (_, id) = map.export_handle().unwrap();
        assert_eq!(env.get(SHM_ENV_VAR), Some(OsStr::new(&id)));
        assert_eq!(env.get("ASAN_OPTIONS"), Some(OsStr::new("user_choice=1")));
        assert_eq!(env.get("MSAN_OPTIONS"), Some(OsStr::new(&msan_options())));
        assert_eq!(env.get("LD_BIND_NOW"), Some(OsStr::new("1")));
        assert!(env.get("LD_PRELOAD").is_none());
    }

    #[test]
    fn test_bind_lazy() {
        let map = TraceMap::anonymous(16).unwrap();
        let mut c = config();
        c.bind_lazy = true;
        let env = TargetEnv::prepare(TargetEnv::default(), &c, &map, &Native);
        assert!(env.get("LD_BIND_NOW").is_none());
        assert!(env.get(SHM_ENV_VAR).is_none());
    }

    #[test]
    fn test_preload_native() {
        let map = TraceMap::anonymous(16).unwrap();
        let mut c = config();
        c.preload = Some("/lib/libdislocator.so".to_string());
        let env = TargetEnv::prepare(TargetEnv::default(), &c, &map, &Native);
        assert_eq!(
            env.get("LD_PRELOAD"),
            Some(OsStr::new("/lib/libdislocator.so"))
        );
        assert_eq!(
            env.get("DYLD_INSERT_LIBRARIES"),
            Some(OsStr::new("/lib/libdislocator.so"))
        );
    }

    #[test]
    fn test_preload_forwarded_to_tracer() {
        let map = TraceMap::anonymous(16).unwrap();
        let mut c = config();
        c.preload = Some("/lib/x.so".to_string());
        let qemu = QemuTrace::new(PathBuf::from("afl-qemu-trace"));

        let env = TargetEnv::prepare(TargetEnv::default(), &c, &map, &qemu);
        assert_eq!(env.get("QEMU_SET_ENV"), Some(OsStr::new("LD_PRELOAD=/lib/x.so")));
        assert!(env.get("LD_PRELOAD").is_none());

        let mut base = TargetEnv::default();
        base.set("QEMU_SET_ENV", "FOO=1");
        let env = TargetEnv::prepare(base, &c, &map, &qemu);
        assert_eq!(
            env.get("QEMU_SET_ENV"),
            Some(OsStr::new("FOO=1,LD_PRELOAD=/lib/x.so"))
        );
    }

    #[test]
    fn test_envp() {
        let mut env = TargetEnv::default();
        env.set("B", "2");
        env.set("A", "1");
        let envp = env.to_envp().unwrap();
        assert_eq!(envp, vec![CString::new("A=1").unwrap(), CString::new("B=2").unwrap()]);
    }
}
