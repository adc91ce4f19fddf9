use std::collections::HashSet;
use std::fs;
use std::io;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::{Builder, TempDir};
use tracing::{debug, warn};

use crate::domain::IndividualId;
use crate::error::SdkError;

pub const GENOTYPE_DIR: &str = "genotype";
pub const PHENOTYPE_DIR: &str = "phenotype";
pub const GENOTYPE_ARCHIVE: &str = "genotype.tar";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subdirs {
    pub genotype: bool,
    pub phenotype: bool,
}

impl Subdirs {
    pub const GENOTYPE: Subdirs = Subdirs {
        genotype: true,
        phenotype: false,
    };
    pub const BOTH: Subdirs = Subdirs {
        genotype: true,
        phenotype: true,
    };
}

#[derive(Debug, Clone)]
pub struct CohortSpec {
    pub name: String,
    pub members: Vec<IndividualId>,
    pub subdirs: Subdirs,
}

#[derive(Debug, Clone, Default)]
pub struct LayoutSpec {
    cohorts: Vec<CohortSpec>,
}

impl LayoutSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cohort(
        mut self,
        name: impl Into<String>,
        members: impl IntoIterator<Item = IndividualId>,
        subdirs: Subdirs,
    ) -> Self {
        self.cohorts.push(CohortSpec {
            name: name.into(),
            members: members.into_iter().collect(),
            subdirs,
        });
        self
    }

    fn check(&self) -> Result<(), SdkError> {
        let mut names = HashSet::new();
        for cohort in &self.cohorts {
            if !names.insert(cohort.name.as_str()) {
                return Err(SdkError::Directory(format!(
                    "cohort '{}' declared twice",
                    cohort.name
                )));
            }
            let mut seen = HashSet::new();
            for member in &cohort.members {
                if !seen.insert(member) {
                    return Err(SdkError::DuplicateIndividual {
                        cohort: cohort.name.clone(),
                        id: member.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct IndividualDirs {
    pub id: IndividualId,
    pub base: Utf8PathBuf,
    pub genotype: Option<Utf8PathBuf>,
    pub phenotype: Option<Utf8PathBuf>,
}

impl IndividualDirs {
    pub fn archive_path(&self) -> Utf8PathBuf {
        self.base.join(GENOTYPE_ARCHIVE)
    }

    pub fn genotype_dir(&self) -> Result<&Utf8Path, SdkError> {
        self.genotype
            .as_deref()
            .ok_or_else(|| SdkError::Directory(format!("no genotype directory for {}", self.id)))
    }

    pub fn phenotype_dir(&self) -> Result<&Utf8Path, SdkError> {
        self.phenotype
            .as_deref()
            .ok_or_else(|| SdkError::Directory(format!("no phenotype directory for {}", self.id)))
    }
}

// Members keep their declaration order.
#[derive(Debug, Clone)]
pub struct DirectorySet {
    name: String,
    entries: Vec<IndividualDirs>,
}

impl DirectorySet {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndividualDirs> {
        self.entries.iter()
    }

    pub fn get(&self, id: &IndividualId) -> Option<&IndividualDirs> {
        self.entries.iter().find(|entry| &entry.id == id)
    }
}

#[derive(Debug, Clone)]
pub struct ScratchSpace {
    base: Utf8PathBuf,
}

impl ScratchSpace {
    pub fn new(base: impl Into<Utf8PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Utf8Path {
        &self.base
    }

    pub async fn provision(&self, layout: LayoutSpec) -> Result<ScratchDir, SdkError> {
        let space = self.clone();
        tokio::task::spawn_blocking(move || space.provision_blocking(&layout))
            .await
            .map_err(|err| SdkError::Directory(err.to_string()))?
    }

    pub fn provision_blocking(&self, layout: &LayoutSpec) -> Result<ScratchDir, SdkError> {
        layout.check()?;
        fs::create_dir_all(self.base.as_std_path())
            .map_err(|err| SdkError::Directory(format!("create {}: {err}", self.base)))?;
        let root = Builder::new()
            .prefix("starbreeder-")
            .tempdir_in(self.base.as_std_path())
            .map_err(|err| SdkError::Directory(format!("allocate root in {}: {err}", self.base)))?;
        let root_path = Utf8PathBuf::from_path_buf(root.path().to_path_buf())
            .map_err(|_| SdkError::Directory("non-utf8 scratch root".to_string()))?;

        // On error `root` drops here and takes the partial tree with it.
        let mut cohorts = Vec::with_capacity(layout.cohorts.len());
        for cohort in &layout.cohorts {
            let mut entries = Vec::with_capacity(cohort.members.len());
            for id in &cohort.members {
                let base = root_path.join(&cohort.name).join(id.as_str());
                let genotype = cohort.subdirs.genotype.then(|| base.join(GENOTYPE_DIR));
                let phenotype = cohort.subdirs.phenotype.then(|| base.join(PHENOTYPE_DIR));
                create_dir(&base)?;
                for dir in genotype.iter().chain(phenotype.iter()) {
                    create_dir(dir)?;
                }
                entries.push(IndividualDirs {
                    id: id.clone(),
                    base,
                    genotype,
                    phenotype,
                });
            }
            cohorts.push(DirectorySet {
                name: cohort.name.clone(),
                entries,
            });
        }

        debug!(root = %root_path, "scratch root provisioned");
        Ok(ScratchDir {
            root: Some(Arc::new(RootGuard {
                dir: Some(root),
                path: root_path.clone(),
            })),
            root_path,
            cohorts,
        })
    }
}

fn create_dir(path: &Utf8Path) -> Result<(), SdkError> {
    fs::create_dir_all(path.as_std_path())
        .map_err(|err| SdkError::Directory(format!("create {path}: {err}")))
}

// Owns the on-disk tree. Whoever drops the last handle removes it.
#[derive(Debug)]
struct RootGuard {
    dir: Option<TempDir>,
    path: Utf8PathBuf,
}

impl RootGuard {
    fn close(mut self) -> io::Result<()> {
        match self.dir.take() {
            Some(dir) => dir.close(),
            None => Ok(()),
        }
    }
}

impl Drop for RootGuard {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            match dir.close() {
                Ok(()) => debug!(root = %self.path, "scratch root removed after last lease"),
                Err(err) => warn!(root = %self.path, error = %err, "failed to remove scratch root"),
            }
        }
    }
}

// Keeps the scratch tree on disk while work that may still touch it is running.
#[derive(Debug, Clone)]
pub struct ScratchLease {
    _guard: Arc<RootGuard>,
}

#[derive(Debug)]
pub struct ScratchDir {
    root: Option<Arc<RootGuard>>,
    root_path: Utf8PathBuf,
    cohorts: Vec<DirectorySet>,
}

impl ScratchDir {
    pub fn root(&self) -> &Utf8Path {
        &self.root_path
    }

    pub fn cohort(&self, name: &str) -> Result<&DirectorySet, SdkError> {
        self.cohorts
            .iter()
            .find(|cohort| cohort.name == name)
            .ok_or_else(|| SdkError::Directory(format!("unknown cohort '{name}'")))
    }

    pub fn is_disposed(&self) -> bool {
        self.root.is_none()
    }

    pub fn lease(&self) -> Option<ScratchLease> {
        self.root.as_ref().map(|guard| ScratchLease {
            _guard: guard.clone(),
        })
    }

    // With an outstanding lease, removal happens when the lease is released.
    pub async fn dispose(&mut self) -> Result<(), SdkError> {
        let Some(guard) = self.root.take() else {
            return Ok(());
        };
        let guard = match Arc::try_unwrap(guard) {
            Ok(guard) => guard,
            Err(_shared) => {
                warn!(root = %self.root_path, "scratch root still leased; removal deferred");
                return Ok(());
            }
        };
        let root_path = self.root_path.clone();
        tokio::task::spawn_blocking(move || guard.close())
            .await
            .map_err(|err| SdkError::Directory(err.to_string()))?
            .map_err(|err| SdkError::Directory(format!("remove {root_path}: {err}")))?;
        debug!(root = %self.root_path, "scratch root disposed");
        Ok(())
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let Some(guard) = self.root.take() else {
            return;
        };
        warn!(root = %self.root_path, "scratch root released without dispose; removing");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || drop(guard));
            }
            Err(_) => drop(guard),
        }
    }
}
