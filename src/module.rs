use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ConfigLoader};
use crate::error::SdkError;

pub type ModuleError = Box<dyn std::error::Error + Send + Sync>;
pub type ModuleResult<T> = Result<T, ModuleError>;

// Handed to every module call. Long-running modules should poll it and stop early.
#[derive(Debug, Clone, Default)]
pub struct ModuleContext {
    cancel: CancellationToken,
}

impl ModuleContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check(&self) -> ModuleResult<()> {
        if self.is_cancelled() {
            return Err("request cancelled".into());
        }
        Ok(())
    }
}

// Every method runs on a blocking worker thread. Directories already exist, are owned by
// the current request and are given as absolute paths.
pub trait Module: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn load_config(&self, path: &Utf8Path) -> Result<Config, SdkError> {
        ConfigLoader::load(path)
    }

    // One genotype per root key, written into its empty directory.
    fn initialize(
        &self,
        genotype_dirs: &BTreeMap<String, Utf8PathBuf>,
        config: &Config,
        params: Option<&Value>,
        context: &ModuleContext,
    ) -> ModuleResult<()>;

    // phenotype_dirs[i] receives the phenotype files of genotype_dirs[i].
    fn evaluate(
        &self,
        genotype_dirs: &[Utf8PathBuf],
        phenotype_dirs: &[Utf8PathBuf],
        config: &Config,
        params: Option<&Value>,
        context: &ModuleContext,
    ) -> ModuleResult<()>;

    // Returns, per child, the indices of the parents used.
    fn generate(
        &self,
        parent_dirs: &[Utf8PathBuf],
        child_dirs: &[Utf8PathBuf],
        config: &Config,
        params: Option<&Value>,
        context: &ModuleContext,
    ) -> ModuleResult<Vec<Vec<usize>>>;
}
