//! Compile targets and the file-to-file compile built on them.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};

use super::job::{Compile, JobContext};

/// Target-specific options (`-o key=value`)
pub type Options = BTreeMap<String, String>;

/// Produces an output file from a source file
pub trait CompileTarget: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the number of bytes written
    fn compile(
        &self,
        source: &Path,
        options: &Options,
        output: &Path,
        ctx: &JobContext<'_>,
    ) -> anyhow::Result<u64>;
}

/// Copies the source through unchanged, one chunk at a time
pub struct RawTarget;

const DEFAULT_CHUNK: usize = 64 * 1024;

impl CompileTarget for RawTarget {
    fn name(&self) -> &str {
        "raw"
    }

    fn compile(
        &self,
        source: &Path,
        options: &Options,
        output: &Path,
        ctx: &JobContext<'_>,
    ) -> anyhow::Result<u64> {
        let chunk_size = match options.get("chunk_size") {
            Some(value) => value
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .with_context(|| format!("invalid chunk_size '{}'", value))?,
            None => DEFAULT_CHUNK,
        };

        let total = fs::metadata(source)?.len();
        let mut reader = File::open(source)?;
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut writer = File::create(output)?;

        let mut buf = vec![0u8; chunk_size];
        let mut copied = 0u64;
        loop {
            ctx.checkpoint()?;
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n])?;
            copied += n as u64;
            ctx.post_update(format!("{} bytes", copied), Some((copied, total)));
        }
        writer.flush()?;
        Ok(copied)
    }
}

/// Look up a built-in target by name
pub fn find_target(name: &str) -> Option<Arc<dyn CompileTarget>> {
    match name {
        "raw" => Some(Arc::new(RawTarget)),
        _ => None,
    }
}

/// Compile one source file to one output file
pub struct FileCompile {
    target: Arc<dyn CompileTarget>,
    source: PathBuf,
    output: PathBuf,
    options: Options,
}

impl FileCompile {
    pub fn new(target: Arc<dyn CompileTarget>, source: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            target,
            source: source.into(),
            output: output.into(),
            options: Options::new(),
        }
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }
}

impl Compile for FileCompile {
    type Output = PathBuf;

    fn title(&self) -> String {
        let file = self
            .source
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.source.display().to_string());
        format!("{} {}", self.target.name(), file)
    }

    fn build(&mut self, ctx: &JobContext<'_>) -> anyhow::Result<PathBuf> {
        if !self.source.is_file() {
            bail!("no such source file: {}", self.source.display());
        }
        ctx.post_update(format!("compiling {}", self.source.display()), None);
        let written = self
            .target
            .compile(&self.source, &self.options, &self.output, ctx)
            .with_context(|| {
                format!(
                    "compiling {} to {}",
                    self.source.display(),
                    self.output.display()
                )
            })?;
        ctx.post_update(format!("{} bytes written", written), None);
        Ok(self.output.clone())
    }

    fn done_message(&self, output: &PathBuf) -> String {
        format!("wrote {}", output.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::job::{CompileJob, Outcome};

    #[test]
    fn test_raw_copy() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in.txt");
        let output = dir.path().join("out/copy.txt");
        fs::write(&source, "hello, world").unwrap();

        let mut options = Options::new();
        options.insert("chunk_size".to_string(), "5".to_string());
        let compile = FileCompile::new(Arc::new(RawTarget), &source, &output).with_options(options);
        let mut job = CompileJob::new(compile);
        assert_eq!(job.title(), "raw in.txt");
        assert_eq!(job.run(), Outcome::Succeeded);
        assert_eq!(fs::read_to_string(&output).unwrap(), "hello, world");
        assert_eq!(job.output(), Some(&output));
    }

    #[test]
    fn test_missing_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let compile = FileCompile::new(
            Arc::new(RawTarget),
            dir.path().join("absent"),
            dir.path().join("out"),
        );
        let mut job = CompileJob::new(compile);
        assert_eq!(job.run(), Outcome::Failed);
        assert!(job.error().unwrap().to_string().contains("no such source file"));
    }

    #[test]
    fn test_bad_chunk_size() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in.txt");
        fs::write(&source, "x").unwrap();
        let mut options = Options::new();
        options.insert("chunk_size".to_string(), "zero".to_string());
        let compile = FileCompile::new(Arc::new(RawTarget), &source, dir.path().join("o"))
            .with_options(options);
        let mut job = CompileJob::new(compile);
        assert_eq!(job.run(), Outcome::Failed);
        assert!(format!("{:#}", job.error().unwrap()).contains("invalid chunk_size"));
    }

    #[test]
    fn test_find_target() {
        assert_eq!(find_target("raw").unwrap().name(), "raw");
        assert!(find_target("pdf").is_none());
    }
}
