use std::path::PathBuf;

/// Rewrites the target command line for backends that don't run the target natively
pub trait ArgvTransform {
    fn rewrite(&self, argv: &[String]) -> Vec<String>;

    /// Variable the backend forwards into the emulated target's environment
    fn env_forward_var(&self) -> Option<&'static str> {
        None
    }
}

/// Target carries its own instrumentation
pub struct Native;

impl ArgvTransform for Native {
    fn rewrite(&self, argv: &[String]) -> Vec<String> {
        argv.to_vec()
    }
}

/// Target runs under a binary translating tracer
pub struct QemuTrace {
    tracer: PathBuf,
}

impl QemuTrace {
    pub fn new(tracer: PathBuf) -> Self {
        Self { tracer }
    }
}

impl ArgvTransform for QemuTrace {
    fn rewrite(&self, argv: &[String]) -> Vec<String> {
        let mut out = Vec::with_capacity(argv.len() + 2);
        out.push(self.tracer.to_string_lossy().into_owned());
        out.push("--".to_string());
        out.extend_from_slice(argv);
        out
    }

    fn env_forward_var(&self) -> Option<&'static str> {
        Some("QEMU_SET_ENV")
    }
}

#[test]
fn test_qemu_rewrite() {
    let argv = vec!["./target".to_string(), "@@".to_string()];
    assert_eq!(Native.rewrite(&argv), argv);

    let qemu = QemuTrace::new(PathBuf::from("/opt/afl/afl-qemu-trace"));
    assert_eq!(
        qemu.rewrite(&argv),
        vec!["/opt/afl/afl-qemu-trace", "--", "./target", "@@"]
    );
    assert_eq!(qemu.env_forward_var(), Some("QEMU_SET_ENV"));
}
