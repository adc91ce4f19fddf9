use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, warn};
use uuid::Uuid;

use crate::archive::{pack_genotype, unpack_genotype};
use crate::batch::{BatchReport, TransferBatch, TransferKey, TransferManifest};
use crate::config::Config;
use crate::domain::{ConfigName, IndividualId, Operation, parse_cohort};
use crate::error::{SdkError, TransferError};
use crate::executor::ModuleExecutor;
use crate::module::Module;
use crate::schema::{
    ChildIndividualResult, EvaluateRequest, EvaluateResponse, FailureStage, GenerateRequest,
    GenerateResponse, IndividualResult, InitializeRequest, InitializeResponse, Outcome,
    RootIndividualRequest, RootIndividualResult,
};
use crate::scratch::{DirectorySet, IndividualDirs, LayoutSpec, ScratchDir, ScratchSpace, Subdirs};
use crate::transfer::TransferJob;

pub const ROOTS: &str = "roots";
pub const INDIVIDUALS: &str = "individuals";
pub const PARENTS: &str = "parents";
pub const CHILDREN: &str = "children";

const GENOTYPE_ARTIFACT: &str = "genotype";
const TAR_CONTENT_TYPE: &str = "application/x-tar";

#[derive(Debug, Clone, Copy)]
enum Phase {
    Provisioning,
    Downloading,
    Executing,
    Uploading,
    Aggregating,
    Disposed,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Provisioning => "provisioning",
            Phase::Downloading => "downloading",
            Phase::Executing => "executing",
            Phase::Uploading => "uploading",
            Phase::Aggregating => "aggregating",
            Phase::Disposed => "disposed",
        }
    }
}

fn enter(phase: Phase) {
    info!(phase = phase.as_str(), "phase");
}

// The first failure recorded for an individual wins.
struct StatusBoard {
    outcomes: BTreeMap<IndividualId, Outcome>,
}

impl StatusBoard {
    fn new(ids: &[IndividualId]) -> Self {
        Self {
            outcomes: ids.iter().map(|id| (id.clone(), Outcome::ok())).collect(),
        }
    }

    fn is_ok(&self, id: &IndividualId) -> bool {
        self.outcomes.get(id).is_some_and(Outcome::is_ok)
    }

    fn fail(&mut self, id: &IndividualId, stage: FailureStage, message: impl Into<String>) {
        let Some(outcome) = self.outcomes.get_mut(id) else {
            return;
        };
        if outcome.is_ok() {
            let message = message.into();
            warn!(individual = %id, stage = ?stage, %message, "individual failed");
            *outcome = Outcome::failed(stage, message);
        }
    }

    fn fail_remaining(&mut self, stage: FailureStage, message: &str) {
        let ids: Vec<IndividualId> = self.outcomes.keys().cloned().collect();
        for id in ids {
            self.fail(&id, stage, message);
        }
    }

    fn record_transfers(&mut self, report: &BatchReport, stage: FailureStage) {
        for (key, err) in report.failures() {
            let stage = match err {
                TransferError::Cancelled => FailureStage::Cancelled,
                _ => stage,
            };
            self.fail(&key.individual, stage, err.to_string());
        }
    }

    fn first_failure<'a>(&'a self, order: &'a [IndividualId]) -> Option<(&'a IndividualId, &'a Outcome)> {
        order.iter().find_map(|id| {
            self.outcomes
                .get(id)
                .filter(|outcome| !outcome.is_ok())
                .map(|outcome| (id, outcome))
        })
    }

    fn outcome(&self, id: &IndividualId) -> Outcome {
        self.outcomes.get(id).cloned().unwrap_or_else(Outcome::ok)
    }

    fn ok_members(&self, cohort: &DirectorySet) -> Vec<IndividualDirs> {
        cohort
            .iter()
            .filter(|dirs| self.is_ok(&dirs.id))
            .cloned()
            .collect()
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    module: Arc<dyn Module>,
    configs_dir: Utf8PathBuf,
    scratch: ScratchSpace,
    transfers: TransferBatch,
    executor: ModuleExecutor,
    request_timeout: Option<Duration>,
}

impl Orchestrator {
    pub fn new(
        module: Arc<dyn Module>,
        configs_dir: impl Into<Utf8PathBuf>,
        scratch: ScratchSpace,
        transfers: TransferBatch,
        executor: ModuleExecutor,
    ) -> Self {
        Self {
            module,
            configs_dir: configs_dir.into(),
            scratch,
            transfers,
            executor,
            request_timeout: None,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn module_name(&self) -> &str {
        self.module.name()
    }

    pub fn configs_dir(&self) -> &Utf8Path {
        &self.configs_dir
    }

    pub async fn load_config(&self, config_name: &str) -> Result<Config, SdkError> {
        let name: ConfigName = config_name.parse()?;
        let path = self.configs_dir.join(name.as_str());
        let module = self.module.clone();
        blocking(move || module.load_config(&path)).await
    }

    pub async fn initialize(
        &self,
        request: InitializeRequest,
        cancel: CancellationToken,
    ) -> Result<InitializeResponse, SdkError> {
        async {
            info!(roots = request.root_individuals.len(), config = %request.config_name, "request received");
            let result = self
                .with_deadline(&cancel, self.run_initialize(&request, &cancel))
                .await;
            match &result {
                Ok(response) => log_finished(response.root_individuals.iter().map(|root| &root.outcome)),
                Err(err) => warn!(error = %err, "request failed"),
            }
            result
        }
        .instrument(request_span(Operation::Initialize))
        .await
    }

    pub async fn evaluate(
        &self,
        request: EvaluateRequest,
        cancel: CancellationToken,
    ) -> Result<EvaluateResponse, SdkError> {
        async {
            info!(individuals = request.individuals.len(), config = %request.config_name, "request received");
            let result = self
                .with_deadline(&cancel, self.run_evaluate(&request, &cancel))
                .await;
            match &result {
                Ok(response) => log_finished(response.individuals.iter().map(|ind| &ind.outcome)),
                Err(err) => warn!(error = %err, "request failed"),
            }
            result
        }
        .instrument(request_span(Operation::Evaluate))
        .await
    }

    pub async fn generate(
        &self,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> Result<GenerateResponse, SdkError> {
        async {
            info!(
                parents = request.parent_individuals.len(),
                children = request.child_individuals.len(),
                config = %request.config_name,
                "request received"
            );
            let result = self
                .with_deadline(&cancel, self.run_generate(&request, &cancel))
                .await;
            match &result {
                Ok(response) => log_finished(response.child_individuals.iter().map(|child| &child.outcome)),
                Err(err) => warn!(error = %err, "request failed"),
            }
            result
        }
        .instrument(request_span(Operation::Generate))
        .await
    }

    // Past the deadline the token is cancelled and the body unwinds on its own.
    async fn with_deadline<T>(
        &self,
        cancel: &CancellationToken,
        body: impl Future<Output = Result<T, SdkError>>,
    ) -> Result<T, SdkError> {
        let Some(limit) = self.request_timeout else {
            return body.await;
        };
        tokio::pin!(body);
        tokio::select! {
            result = &mut body => return result,
            _ = tokio::time::sleep(limit) => {}
        }
        warn!(timeout = ?limit, "request deadline exceeded; cancelling");
        cancel.cancel();
        body.await
    }

    async fn run_initialize(
        &self,
        request: &InitializeRequest,
        cancel: &CancellationToken,
    ) -> Result<InitializeResponse, SdkError> {
        let ids = parse_cohort(ROOTS, request.root_individuals.iter().map(|root| root.id.as_str()))?;
        let config = self.load_config(&request.config_name).await?;
        check_root_keys(&config, &request.root_individuals)?;

        enter(Phase::Provisioning);
        let layout = LayoutSpec::new().cohort(ROOTS, ids.clone(), Subdirs::GENOTYPE);
        let mut scratch = self.scratch.provision(layout).await?;
        let result = self
            .initialize_in(&scratch, request, &ids, config, cancel)
            .await;
        self.dispose(&mut scratch).await;
        result
    }

    async fn initialize_in(
        &self,
        scratch: &ScratchDir,
        request: &InitializeRequest,
        ids: &[IndividualId],
        config: Config,
        cancel: &CancellationToken,
    ) -> Result<InitializeResponse, SdkError> {
        let roots = scratch.cohort(ROOTS)?;
        let mut genotype_dirs = BTreeMap::new();
        for (root, id) in request.root_individuals.iter().zip(ids) {
            let dirs = lookup(roots, id)?;
            genotype_dirs.insert(root.key.clone(), dirs.genotype_dir()?.to_owned());
        }

        enter(Phase::Executing);
        let module = self.module.clone();
        let params = request.params.clone();
        let lease = scratch.lease();
        self.executor
            .run(Operation::Initialize, cancel, move |context| {
                let _lease = lease;
                module.initialize(&genotype_dirs, &config, params.as_ref(), context)
            })
            .await?;

        enter(Phase::Uploading);
        let mut board = StatusBoard::new(ids);
        let put_urls: BTreeMap<IndividualId, String> = ids
            .iter()
            .cloned()
            .zip(request.root_individuals.iter().map(|root| root.genotype_put_url.clone()))
            .collect();
        self.upload_genotypes(roots, &put_urls, &mut board, cancel)
            .await;
        ensure_not_cancelled(cancel, Operation::Initialize)?;

        enter(Phase::Aggregating);
        let root_individuals = request
            .root_individuals
            .iter()
            .zip(ids)
            .map(|(root, id)| RootIndividualResult {
                id: root.id.clone(),
                key: root.key.clone(),
                parent_ids: Vec::new(),
                outcome: board.outcome(id),
            })
            .collect();
        Ok(InitializeResponse { root_individuals })
    }

    async fn run_evaluate(
        &self,
        request: &EvaluateRequest,
        cancel: &CancellationToken,
    ) -> Result<EvaluateResponse, SdkError> {
        let ids = parse_cohort(INDIVIDUALS, request.individuals.iter().map(|ind| ind.id.as_str()))?;
        let mut board = StatusBoard::new(&ids);

        match self.load_config(&request.config_name).await {
            Ok(config) => {
                enter(Phase::Provisioning);
                let layout = LayoutSpec::new().cohort(INDIVIDUALS, ids.clone(), Subdirs::BOTH);
                let mut scratch = self.scratch.provision(layout).await?;
                let result = self
                    .evaluate_in(&scratch, request, &ids, &config, &mut board, cancel)
                    .await;
                self.dispose(&mut scratch).await;
                result?;
            }
            Err(err) => board.fail_remaining(FailureStage::Config, &err.to_string()),
        }

        enter(Phase::Aggregating);
        let individuals = request
            .individuals
            .iter()
            .zip(&ids)
            .map(|(individual, id)| IndividualResult {
                id: individual.id.clone(),
                outcome: board.outcome(id),
            })
            .collect();
        Ok(EvaluateResponse { individuals })
    }

    async fn evaluate_in(
        &self,
        scratch: &ScratchDir,
        request: &EvaluateRequest,
        ids: &[IndividualId],
        config: &Config,
        board: &mut StatusBoard,
        cancel: &CancellationToken,
    ) -> Result<(), SdkError> {
        let cohort = scratch.cohort(INDIVIDUALS)?;

        enter(Phase::Downloading);
        let get_urls: BTreeMap<IndividualId, String> = ids
            .iter()
            .cloned()
            .zip(request.individuals.iter().map(|ind| ind.genotype_get_url.clone()))
            .collect();
        self.download_genotypes(cohort, &get_urls, board, cancel)
            .await;

        let survivors = board.ok_members(cohort);
        if survivors.is_empty() {
            info!("no individual left to evaluate");
            return Ok(());
        }

        enter(Phase::Executing);
        let genotype_dirs = survivors
            .iter()
            .map(|dirs| dirs.genotype_dir().map(Utf8Path::to_owned))
            .collect::<Result<Vec<_>, _>>()?;
        let phenotype_dirs = survivors
            .iter()
            .map(|dirs| dirs.phenotype_dir().map(Utf8Path::to_owned))
            .collect::<Result<Vec<_>, _>>()?;
        let module = self.module.clone();
        let module_config = config.clone();
        let params = request.params.clone();
        let lease = scratch.lease();
        let executed = self
            .executor
            .run(Operation::Evaluate, cancel, move |context| {
                let _lease = lease;
                module.evaluate(
                    &genotype_dirs,
                    &phenotype_dirs,
                    &module_config,
                    params.as_ref(),
                    context,
                )
            })
            .await;
        if let Err(err) = executed {
            let stage = match err {
                SdkError::Cancelled(_) => FailureStage::Cancelled,
                _ => FailureStage::Execute,
            };
            board.fail_remaining(stage, &err.to_string());
            return Ok(());
        }

        enter(Phase::Uploading);
        let put_urls: BTreeMap<IndividualId, &BTreeMap<String, String>> = ids
            .iter()
            .cloned()
            .zip(request.individuals.iter().map(|ind| &ind.phenotype_put_urls))
            .collect();
        let mut manifest = TransferManifest::new();
        for dirs in &survivors {
            let Some(urls) = put_urls.get(&dirs.id) else {
                continue;
            };
            let phenotype_dir = dirs.phenotype_dir()?;
            for (key, file) in &config.evaluate.phenotype {
                let Some(url) = urls.get(key) else {
                    continue;
                };
                let path = phenotype_dir.join(&file.name);
                if !tokio::fs::try_exists(path.as_std_path()).await.unwrap_or(false) {
                    debug!(individual = %dirs.id, phenotype = %key, "phenotype file not produced; skipping upload");
                    continue;
                }
                manifest.insert(
                    TransferKey::new(dirs.id.clone(), format!("phenotype/{key}")),
                    TransferJob::upload(url.clone(), path, file.content_type.clone()),
                );
            }
        }
        let report = self.transfers.run(manifest, cancel).await;
        board.record_transfers(&report, FailureStage::Upload);
        Ok(())
    }

    async fn run_generate(
        &self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerateResponse, SdkError> {
        let parents = parse_cohort(PARENTS, request.parent_individuals.iter().map(|p| p.id.as_str()))?;
        let children = parse_cohort(CHILDREN, request.child_individuals.iter().map(|c| c.id.as_str()))?;
        let config = self.load_config(&request.config_name).await?;

        enter(Phase::Provisioning);
        let layout = LayoutSpec::new()
            .cohort(PARENTS, parents.clone(), Subdirs::GENOTYPE)
            .cohort(CHILDREN, children.clone(), Subdirs::GENOTYPE);
        let mut scratch = self.scratch.provision(layout).await?;
        let result = self
            .generate_in(&scratch, request, &parents, &children, config, cancel)
            .await;
        self.dispose(&mut scratch).await;
        result
    }

    async fn generate_in(
        &self,
        scratch: &ScratchDir,
        request: &GenerateRequest,
        parents: &[IndividualId],
        children: &[IndividualId],
        config: Config,
        cancel: &CancellationToken,
    ) -> Result<GenerateResponse, SdkError> {
        let parent_set = scratch.cohort(PARENTS)?;
        let child_set = scratch.cohort(CHILDREN)?;

        enter(Phase::Downloading);
        let mut parent_board = StatusBoard::new(parents);
        let get_urls: BTreeMap<IndividualId, String> = parents
            .iter()
            .cloned()
            .zip(request.parent_individuals.iter().map(|p| p.genotype_get_url.clone()))
            .collect();
        self.download_genotypes(parent_set, &get_urls, &mut parent_board, cancel)
            .await;
        if let Some((id, outcome)) = parent_board.first_failure(parents) {
            if outcome.stage == Some(FailureStage::Cancelled) {
                return Err(SdkError::Cancelled(
                    "generate cancelled while downloading parents".to_string(),
                ));
            }
            return Err(SdkError::InputUnavailable {
                id: id.to_string(),
                reason: outcome.message.clone().unwrap_or_default(),
            });
        }

        enter(Phase::Executing);
        let parent_dirs = genotype_paths(parent_set, parents)?;
        let child_dirs = genotype_paths(child_set, children)?;
        let module = self.module.clone();
        let params = request.params.clone();
        let lease = scratch.lease();
        let parentage = self
            .executor
            .run(Operation::Generate, cancel, move |context| {
                let _lease = lease;
                module.generate(&parent_dirs, &child_dirs, &config, params.as_ref(), context)
            })
            .await?;
        check_parentage(&parentage, parents.len(), children.len())?;

        enter(Phase::Uploading);
        let mut board = StatusBoard::new(children);
        let put_urls: BTreeMap<IndividualId, String> = children
            .iter()
            .cloned()
            .zip(request.child_individuals.iter().map(|c| c.genotype_put_url.clone()))
            .collect();
        self.upload_genotypes(child_set, &put_urls, &mut board, cancel)
            .await;
        ensure_not_cancelled(cancel, Operation::Generate)?;

        enter(Phase::Aggregating);
        let child_individuals = request
            .child_individuals
            .iter()
            .zip(children)
            .zip(&parentage)
            .map(|((child, id), indices)| ChildIndividualResult {
                id: child.id.clone(),
                parent_ids: indices
                    .iter()
                    .map(|&index| request.parent_individuals[index].id.clone())
                    .collect(),
                parent_indices: indices.clone(),
                outcome: board.outcome(id),
            })
            .collect();
        Ok(GenerateResponse {
            child_individuals,
            parentage,
        })
    }

    async fn download_genotypes(
        &self,
        cohort: &DirectorySet,
        urls: &BTreeMap<IndividualId, String>,
        board: &mut StatusBoard,
        cancel: &CancellationToken,
    ) {
        let mut manifest = TransferManifest::new();
        for dirs in cohort.iter() {
            if let Some(url) = urls.get(&dirs.id) {
                manifest.insert(
                    TransferKey::new(dirs.id.clone(), GENOTYPE_ARTIFACT),
                    TransferJob::download(url.clone(), dirs.archive_path()),
                );
            }
        }
        let report = self.transfers.run(manifest, cancel).await;
        board.record_transfers(&report, FailureStage::Download);

        let unpacked = join_all(board.ok_members(cohort).into_iter().map(|dirs| async move {
            let archive = dirs.archive_path();
            let base = dirs.base.clone();
            let result = blocking(move || unpack_genotype(&archive, &base)).await;
            (dirs.id, result)
        }))
        .await;
        for (id, result) in unpacked {
            if let Err(err) = result {
                board.fail(&id, FailureStage::Unpack, err.to_string());
            }
        }
    }

    async fn upload_genotypes(
        &self,
        cohort: &DirectorySet,
        urls: &BTreeMap<IndividualId, String>,
        board: &mut StatusBoard,
        cancel: &CancellationToken,
    ) {
        let packed = join_all(board.ok_members(cohort).into_iter().map(|dirs| async move {
            let base = dirs.base.clone();
            let result = blocking(move || pack_genotype(&base)).await;
            (dirs.id, result)
        }))
        .await;

        let mut manifest = TransferManifest::new();
        for (id, result) in packed {
            match result {
                Ok(archive) => {
                    if let Some(url) = urls.get(&id) {
                        manifest.insert(
                            TransferKey::new(id, GENOTYPE_ARTIFACT),
                            TransferJob::upload(url.clone(), archive, TAR_CONTENT_TYPE),
                        );
                    }
                }
                Err(err) => board.fail(&id, FailureStage::Pack, err.to_string()),
            }
        }
        let report = self.transfers.run(manifest, cancel).await;
        board.record_transfers(&report, FailureStage::Upload);
    }

    async fn dispose(&self, scratch: &mut ScratchDir) {
        enter(Phase::Disposed);
        if let Err(err) = scratch.dispose().await {
            warn!(root = %scratch.root(), error = %err, "failed to dispose scratch root");
        }
    }
}

fn request_span(operation: Operation) -> Span {
    info_span!("request", %operation, request_id = %Uuid::new_v4())
}

fn log_finished<'a>(outcomes: impl Iterator<Item = &'a Outcome>) {
    let (ok, failed) = outcomes.fold((0usize, 0usize), |(ok, failed), outcome| {
        if outcome.is_ok() {
            (ok + 1, failed)
        } else {
            (ok, failed + 1)
        }
    });
    info!(ok, failed, "request finished");
}

async fn blocking<T, F>(job: F) -> Result<T, SdkError>
where
    F: FnOnce() -> Result<T, SdkError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|err| SdkError::Server(format!("blocking task failed: {err}")))?
}

fn lookup<'a>(cohort: &'a DirectorySet, id: &IndividualId) -> Result<&'a IndividualDirs, SdkError> {
    cohort.get(id).ok_or_else(|| {
        SdkError::Directory(format!("{id} has no directory in cohort {}", cohort.name()))
    })
}

fn genotype_paths(cohort: &DirectorySet, ids: &[IndividualId]) -> Result<Vec<Utf8PathBuf>, SdkError> {
    ids.iter()
        .map(|id| lookup(cohort, id).and_then(|dirs| dirs.genotype_dir().map(Utf8Path::to_owned)))
        .collect()
}

fn ensure_not_cancelled(cancel: &CancellationToken, operation: Operation) -> Result<(), SdkError> {
    if cancel.is_cancelled() {
        return Err(SdkError::Cancelled(format!("{operation} aborted before completion")));
    }
    Ok(())
}

// Exact match with the configured keys, no repeats.
fn check_root_keys(config: &Config, roots: &[RootIndividualRequest]) -> Result<(), SdkError> {
    let expected: Vec<String> = config.initialize.root_individuals.keys().cloned().collect();
    let mut requested: Vec<String> = roots.iter().map(|root| root.key.clone()).collect();
    let unique: BTreeSet<&str> = requested.iter().map(String::as_str).collect();
    let matches = unique.len() == requested.len()
        && unique.iter().copied().eq(expected.iter().map(String::as_str));
    if !matches {
        requested.sort();
        return Err(SdkError::RootKeyMismatch {
            expected,
            requested,
        });
    }
    Ok(())
}

pub fn check_parentage(
    parentage: &[Vec<usize>],
    parents: usize,
    children: usize,
) -> Result<(), SdkError> {
    if parentage.len() != children {
        return Err(SdkError::ModuleExecution(format!(
            "parentage has {} entries for {children} children",
            parentage.len()
        )));
    }
    for (child, indices) in parentage.iter().enumerate() {
        if let Some(index) = indices.iter().find(|&&index| index >= parents) {
            return Err(SdkError::ModuleExecution(format!(
                "child {child} references parent index {index} but only {parents} parents were given"
            )));
        }
    }
    Ok(())
}
