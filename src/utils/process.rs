use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::errors::{Aborted, CmdFailed};
use crate::utils::cancel::Ctx;

/// Value for environment variables
#[derive(Clone, Debug)]
#[allow(dead_code)]
pub enum EnvValue {
    Plain(String),
    Secret(String),
}

/// Command specification
#[derive(Clone, Debug)]
pub struct CmdSpec {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, EnvValue)>,
    /// Indexes into `args` holding secret values; redacted by `render`.
    pub secret_args: Vec<usize>,
}

impl CmdSpec {
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            secret_args: Vec::new(),
        }
    }

    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    pub fn args<I, S>(mut self, it: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(it.into_iter().map(Into::into));
        self
    }

    /// Append an argument whose value must never appear in rendered
    /// command lines or error messages.
    pub fn arg_secret(mut self, a: impl Into<String>) -> Self {
        self.secret_args.push(self.args.len());
        self.args.push(a.into());
        self
    }

    pub fn env(mut self, k: impl Into<String>, v: EnvValue) -> Self {
        self.envs.push((k.into(), v));
        self
    }

    /// Program and args joined with spaces; used for matching and contexts.
    pub fn line(&self) -> String {
        let mut s = self.program.clone();
        for a in &self.args {
            s.push(' ');
            s.push_str(a);
        }
        s
    }

    /// Render this command with quoting and redacted secrets
    pub fn render(&self) -> String {
        let prog = sh_quote(&self.program);
        let args: Vec<String> = self
            .args
            .iter()
            .enumerate()
            .map(|(i, a)| {
                if self.secret_args.contains(&i) {
                    "<redacted>".to_string()
                } else {
                    sh_quote(a)
                }
            })
            .collect();
        let mut env_prefix = String::new();
        for (k, v) in &self.envs {
            match v {
                EnvValue::Plain(val) => env_prefix.push_str(&format!("{k}={} ", sh_quote(val))),
                EnvValue::Secret(_) => env_prefix.push_str(&format!("{k}=<redacted> ")),
            }
        }
        format!("{}{} {}", env_prefix, prog, args.join(" "))
    }
}

pub trait Runner: Send + Sync {
    /// Run to completion with stdout and stderr merged into one buffer.
    /// Non-zero exit surfaces as [`CmdFailed`] carrying the merged bytes;
    /// context cancellation kills the child and surfaces as [`Aborted`].
    fn run_combined(&self, ctx: &Ctx, spec: &CmdSpec) -> Result<Vec<u8>>;

    /// Spawn without waiting; stdio is detached. Returns the child PID.
    fn spawn_detached(&self, spec: &CmdSpec) -> Result<u32>;
}

/// Convenience wrapper returning lossy UTF-8.
pub fn run_text(runner: &dyn Runner, ctx: &Ctx, spec: &CmdSpec) -> Result<String> {
    let out = runner.run_combined(ctx, spec)?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

#[derive(Default, Clone)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

const WAIT_POLL: Duration = Duration::from_millis(25);

impl Runner for ProcessRunner {
    fn run_combined(&self, ctx: &Ctx, spec: &CmdSpec) -> Result<Vec<u8>> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (k, v) in &spec.envs {
            match v {
                EnvValue::Plain(val) | EnvValue::Secret(val) => cmd.env(k, val),
            };
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {}", spec.render()))?;

        let mut out_pipe = child.stdout.take();
        let mut err_pipe = child.stderr.take();
        let out_t = thread::spawn(move || drain(&mut out_pipe));
        let err_t = thread::spawn(move || drain(&mut err_pipe));

        let status = loop {
            if let Some(status) = child
                .try_wait()
                .with_context(|| format!("wait for {}", spec.render()))?
            {
                break status;
            }
            if ctx.cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(anyhow!(Aborted(format!("cancelled: {}", spec.render()))));
            }
            if ctx.deadline_expired() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(anyhow!("command timed out: {}", spec.render()));
            }
            thread::sleep(WAIT_POLL);
        };

        let mut output = out_t.join().unwrap_or_default();
        output.extend(err_t.join().unwrap_or_default());

        if status.success() {
            Ok(output)
        } else {
            Err(anyhow!(CmdFailed {
                rendered: spec.render(),
                status: status.code().unwrap_or(-1),
                output,
            }))
        }
    }

    fn spawn_detached(&self, spec: &CmdSpec) -> Result<u32> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        for (k, v) in &spec.envs {
            match v {
                EnvValue::Plain(val) | EnvValue::Secret(val) => cmd.env(k, val),
            };
        }
        let child = cmd
            .spawn()
            .with_context(|| format!("spawn detached {}", spec.render()))?;
        Ok(child.id())
    }
}

fn drain(pipe: &mut Option<impl Read>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(p) = pipe.as_mut() {
        let _ = p.read_to_end(&mut buf);
    }
    buf
}

fn sh_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".into();
    }
    if !s
        .bytes()
        .any(|b| b == b' ' || b == b'\'' || b == b'"' || b == b'\\')
    {
        return s.to_string();
    }
    let mut out = String::from("'");
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// Single-quote a path for embedding into a generated shell script.
pub fn quote_path(p: &std::path::Path) -> String {
    let s = p.display().to_string();
    let mut out = String::from("'");
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
pub mod testing {
    use std::sync::Mutex;

    use super::*;

    struct Rule {
        prefix: String,
        output: Vec<u8>,
        status: i32,
        times: Option<usize>,
    }

    /// Programmable [`Runner`] for tests: responses are matched by command
    /// line prefix, every invocation is recorded.
    #[derive(Default)]
    pub struct ScriptedRunner {
        rules: Mutex<Vec<Rule>>,
        calls: Mutex<Vec<String>>,
        spawned: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn ok(&self, prefix: &str, output: &[u8]) {
            self.push(prefix, output, 0, None);
        }

        pub fn fail(&self, prefix: &str, output: &[u8], status: i32) {
            self.push(prefix, output, status, None);
        }

        /// Apply the rule to the first `times` matching invocations, then
        /// fall through to later rules (or the default empty success).
        pub fn fail_times(&self, prefix: &str, output: &[u8], status: i32, times: usize) {
            self.push(prefix, output, status, Some(times));
        }

        fn push(&self, prefix: &str, output: &[u8], status: i32, times: Option<usize>) {
            self.rules.lock().unwrap().push(Rule {
                prefix: prefix.to_string(),
                output: output.to_vec(),
                status,
                times,
            });
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn spawned(&self) -> Vec<String> {
            self.spawned.lock().unwrap().clone()
        }

        pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter(|c| c.starts_with(prefix))
                .collect()
        }
    }

    impl Runner for ScriptedRunner {
        fn run_combined(&self, ctx: &Ctx, spec: &CmdSpec) -> Result<Vec<u8>> {
            if ctx.cancelled() {
                return Err(anyhow!(Aborted(format!("cancelled: {}", spec.line()))));
            }
            let line = spec.line();
            self.calls.lock().unwrap().push(line.clone());

            let mut rules = self.rules.lock().unwrap();
            for rule in rules.iter_mut() {
                if !line.starts_with(&rule.prefix) {
                    continue;
                }
                if let Some(left) = rule.times.as_mut() {
                    if *left == 0 {
                        continue;
                    }
                    *left -= 1;
                }
                if rule.status == 0 {
                    return Ok(rule.output.clone());
                }
                return Err(anyhow!(CmdFailed {
                    rendered: spec.render(),
                    status: rule.status,
                    output: rule.output.clone(),
                }));
            }
            Ok(Vec::new())
        }

        fn spawn_detached(&self, spec: &CmdSpec) -> Result<u32> {
            self.spawned.lock().unwrap().push(spec.line());
            Ok(4242)
        }
    }
}
