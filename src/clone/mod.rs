//! Clone Module
//!
//! Brings a local tablet replica up to a requested version by copying
//! snapshot files from a remote replica.
//!
//! An existing replica is repaired: only the missing versions are fetched
//! into `<tablet_path>/clone`, linked into the tablet and added to its
//! meta. When the source cannot serve exactly those versions it sends the
//! whole tablet and the local rowset set is replaced up to the source's
//! max version. A replica this node does not have yet is bootstrapped
//! straight into a new tablet directory.
//!
//! ```text
//! Start -> LookupLocal -> IncrementalRepair | FullBootstrap
//!       -> LinkFiles -> ReviseMetadata -> Report -> Done
//! ```
//!
//! Any phase may end in `Abort`.

pub mod finish;
pub mod link;
mod pool;
pub mod transfer;

pub use pool::CloneTaskPool;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::CloneConfig;
use crate::error::{Error, Result};
use crate::http::{HttpClient, SnapshotFileEndpoint};
use crate::network::{RemoteSnapshot, SnapshotRequest, SnapshotService};
use crate::snapshot::PendingRowsetGuard;
use crate::storage::{fs, DataDir, StorageEngine, StorageMedium, TabletManager};
use crate::tablet::{TabletInfo, TabletMeta, TabletSharedPtr, TabletState};
use crate::version::{format_versions, Version, Versions};

use finish::RemoveDirOnDrop;
use transfer::TransferStats;

/// Staging directory name inside a tablet directory
pub const CLONE_PREFIX: &str = "clone";
/// Transition reason registered while a clone runs
const CLONE_REASON: &str = "clone";

/// A node holding a replica to clone from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBackend {
    pub host: String,
    /// Snapshot RPC port
    pub be_port: u16,
    /// Snapshot file HTTP port
    pub http_port: u16,
}

impl SourceBackend {
    pub fn new(host: impl Into<String>, be_port: u16, http_port: u16) -> Self {
        Self {
            host: host.into(),
            be_port,
            http_port,
        }
    }
}

impl fmt::Display for SourceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.be_port, self.http_port)
    }
}

/// Parses `host:be_port:http_port`
impl FromStr for SourceBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidArgument(format!("expected host:be_port:http_port, got {}", s));
        let mut parts = s.rsplitn(3, ':');
        let http_port = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let be_port = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let host = parts.next().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
        Ok(Self::new(host, be_port, http_port))
    }
}

/// One request to bring a tablet replica up to `version`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneRequest {
    pub tablet_id: i64,
    pub schema_hash: i32,
    pub replica_id: i64,
    pub table_id: i64,
    pub partition_id: i64,
    /// Visible version the replica must reach
    pub version: i64,
    /// Tried in order until one succeeds
    pub src_backends: Vec<SourceBackend>,
    pub timeout_s: Option<u64>,
    pub storage_medium: Option<StorageMedium>,
    pub dest_path_hash: Option<i64>,
    pub signature: i64,
}

impl CloneRequest {
    pub fn new(tablet_id: i64, schema_hash: i32, replica_id: i64, version: i64) -> Self {
        Self {
            tablet_id,
            schema_hash,
            replica_id,
            table_id: 0,
            partition_id: 0,
            version,
            src_backends: Vec::new(),
            timeout_s: None,
            storage_medium: None,
            dest_path_hash: None,
            signature: tablet_id,
        }
    }
}

/// Phase of a clone task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClonePhase {
    Start,
    LookupLocal,
    IncrementalRepair,
    FullBootstrap,
    LinkFiles,
    ReviseMetadata,
    Report,
    Done,
    Abort,
}

impl fmt::Display for ClonePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClonePhase::Start => "start",
            ClonePhase::LookupLocal => "lookup_local",
            ClonePhase::IncrementalRepair => "incremental_repair",
            ClonePhase::FullBootstrap => "full_bootstrap",
            ClonePhase::LinkFiles => "link_files",
            ClonePhase::ReviseMetadata => "revise_metadata",
            ClonePhase::Report => "report",
            ClonePhase::Done => "done",
            ClonePhase::Abort => "abort",
        };
        f.write_str(name)
    }
}

/// What a clone has to do for the local replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClonePlan {
    /// The replica already has every version up to the target
    Satisfied,
    /// Fetch `missed` for an existing replica
    Repair {
        specified_version: i64,
        missed: Versions,
    },
    /// Build the replica from a full snapshot
    Bootstrap,
}

/// Shared state of every clone task on a node
pub struct CloneContext {
    engine: Arc<StorageEngine>,
    snapshots: Arc<dyn SnapshotService>,
    config: CloneConfig,
    token: String,
}

impl CloneContext {
    pub fn new(
        engine: Arc<StorageEngine>,
        snapshots: Arc<dyn SnapshotService>,
        config: CloneConfig,
        token: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            snapshots,
            config,
            token: token.into(),
        }
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }
}

/// Keeps a tablet registered as in transition
struct TransitionGuard<'a> {
    manager: &'a TabletManager,
    tablet_id: i64,
}

impl<'a> TransitionGuard<'a> {
    fn register(manager: &'a TabletManager, tablet_id: i64) -> Result<Self> {
        manager.register_transition_tablet(tablet_id, CLONE_REASON)?;
        Ok(Self { manager, tablet_id })
    }
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        self.manager
            .unregister_transition_tablet(self.tablet_id, CLONE_REASON);
    }
}

/// Deletes a half-built tablet dir and its empty parent unless disarmed
struct BootstrapDirGuard {
    tablet_dir: std::path::PathBuf,
    armed: bool,
}

impl BootstrapDirGuard {
    fn new(tablet_dir: std::path::PathBuf) -> Self {
        Self {
            tablet_dir,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for BootstrapDirGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::info!(dir = %self.tablet_dir.display(), "clone failed, deleting tablet dir");
        if let Err(e) = fs::delete_directory(&self.tablet_dir) {
            tracing::warn!(error = %e, "failed to delete useless clone dir");
        }
        if let Err(e) = DataDir::delete_tablet_parent_path_if_empty(&self.tablet_dir) {
            tracing::warn!(error = %e, "failed to delete parent dir");
        }
    }
}

/// One clone attempt for one tablet
pub struct EngineCloneTask {
    context: Arc<CloneContext>,
    req: CloneRequest,
    phase: ClonePhase,
    is_new_tablet: bool,
    pending_rs_guards: Vec<PendingRowsetGuard>,
    copy_stats: TransferStats,
}

impl EngineCloneTask {
    pub fn new(context: Arc<CloneContext>, req: CloneRequest) -> Self {
        Self {
            context,
            req,
            phase: ClonePhase::Start,
            is_new_tablet: false,
            pending_rs_guards: Vec::new(),
            copy_stats: TransferStats::default(),
        }
    }

    pub fn phase(&self) -> ClonePhase {
        self.phase
    }

    /// Bytes and time spent copying files in the last successful download
    pub fn copy_stats(&self) -> TransferStats {
        self.copy_stats
    }

    fn enter(&mut self, phase: ClonePhase) {
        tracing::debug!(
            tablet_id = self.req.tablet_id,
            signature = self.req.signature,
            from = %self.phase,
            to = %phase,
            "clone phase"
        );
        self.phase = phase;
    }

    /// Run the clone; the tablet's report is appended to `tablet_infos`
    pub fn execute(&mut self, tablet_infos: &mut Vec<TabletInfo>) -> Result<()> {
        let result = self.do_clone(tablet_infos);
        self.context
            .engine
            .tablet_manager()
            .update_partitions_visible_version(self.req.partition_id, self.req.version);
        self.pending_rs_guards.clear();

        match &result {
            Ok(()) => self.enter(ClonePhase::Done),
            Err(e) => {
                tracing::warn!(
                    tablet_id = self.req.tablet_id,
                    replica_id = self.req.replica_id,
                    version = self.req.version,
                    signature = self.req.signature,
                    phase = %self.phase,
                    error = %e,
                    "clone failed"
                );
                self.enter(ClonePhase::Abort);
            }
        }
        result
    }

    fn do_clone(&mut self, tablet_infos: &mut Vec<TabletInfo>) -> Result<()> {
        let context = Arc::clone(&self.context);
        let manager = context.engine.tablet_manager();
        let _transition = TransitionGuard::register(manager, self.req.tablet_id)?;

        self.enter(ClonePhase::LookupLocal);
        let mut tablet = manager.get_tablet(self.req.tablet_id);
        if let Some(t) = tablet.as_ref().filter(|t| t.tablet_state() == TabletState::NotReady) {
            tracing::warn!(
                tablet_id = t.tablet_id(),
                "tablet state is not ready when clone, dropping old tablet"
            );
            manager.drop_tablet(t.tablet_id(), t.replica_id(), false)?;
            tablet = None;
        }
        self.is_new_tablet = tablet.is_none();

        match tablet {
            Some(tablet) => self.repair_existing(&tablet)?,
            None => self.bootstrap_new()?,
        }
        self.report(tablet_infos)
    }

    /// Version the replica is brought to, below any pending publish of a
    /// merge-on-write tablet
    fn specified_version(&self, tablet: &TabletSharedPtr) -> i64 {
        let mut specified = self.req.version;
        if tablet.enable_unique_key_merge_on_write() {
            let min_pending = self
                .context
                .engine
                .get_pending_publish_min_version(tablet.tablet_id());
            if min_pending.saturating_sub(1) < specified {
                tracing::info!(
                    tablet_id = tablet.tablet_id(),
                    min_pending,
                    visible_version = self.req.version,
                    "use min pending publish version for clone"
                );
                specified = min_pending - 1;
            }
        }
        specified
    }

    fn plan_existing(&self, tablet: &TabletSharedPtr) -> ClonePlan {
        let specified_version = self.specified_version(tablet);
        let missed = tablet.missed_versions(specified_version);
        if missed.is_empty() {
            ClonePlan::Satisfied
        } else {
            ClonePlan::Repair {
                specified_version,
                missed,
            }
        }
    }

    fn repair_existing(&mut self, tablet: &TabletSharedPtr) -> Result<()> {
        let _migration = tablet.try_migration_read()?;
        if tablet.replica_id() < self.req.replica_id {
            tablet.set_replica_id(self.req.replica_id)?;
        }

        let (specified_version, missed) = match self.plan_existing(tablet) {
            ClonePlan::Repair {
                specified_version,
                missed,
            } => (specified_version, missed),
            _ => {
                tracing::info!(
                    tablet_id = self.req.tablet_id,
                    replica_id = self.req.replica_id,
                    "missed version size = 0, skip clone"
                );
                return Ok(());
            }
        };

        self.enter(ClonePhase::IncrementalRepair);
        tracing::info!(
            tablet_id = self.req.tablet_id,
            replica_id = self.req.replica_id,
            visible_version = self.req.version,
            signature = self.req.signature,
            missed_versions = %format_versions(&missed),
            "clone to existing tablet"
        );

        let clone_dir = RemoveDirOnDrop::new(tablet.tablet_path().join(CLONE_PREFIX));
        let allow_incremental =
            self.make_and_download_snapshots(tablet.data_dir(), clone_dir.path(), &missed)?;
        self.finish_clone(tablet, clone_dir.path(), specified_version, allow_incremental)
    }

    fn bootstrap_new(&mut self) -> Result<()> {
        self.enter(ClonePhase::FullBootstrap);
        tracing::info!(
            tablet_id = self.req.tablet_id,
            replica_id = self.req.replica_id,
            visible_version = self.req.version,
            signature = self.req.signature,
            "clone tablet not exist, begin clone a new tablet"
        );

        let context = Arc::clone(&self.context);
        let engine = &context.engine;
        let (data_dir, shard) = engine.obtain_shard_path(
            self.req.storage_medium,
            self.req.dest_path_hash,
            self.req.partition_id,
        )?;
        let tablet_dir = data_dir.tablet_path(shard, self.req.tablet_id, self.req.schema_hash);
        let mut dir_guard = BootstrapDirGuard::new(tablet_dir.clone());

        if fs::exists(&tablet_dir)? {
            tracing::warn!(dir = %tablet_dir.display(), "clone dest dir exists, removing it first");
            fs::delete_directory(&tablet_dir)?;
        }

        self.make_and_download_snapshots(&data_dir, &tablet_dir, &[])?;

        let manager = engine.tablet_manager();
        let tablet = manager.load_tablet_from_dir(
            &data_dir,
            shard,
            self.req.tablet_id,
            self.req.schema_hash,
            false,
        )?;
        let adopted = (|| {
            tablet.set_replica_id(self.req.replica_id)?;
            link::adopt_bootstrap_binlogs(&tablet)?;
            // the meta store holds the meta from now on
            fs::delete_file(&TabletMeta::header_file_path(&tablet_dir, self.req.tablet_id))
        })();
        if let Err(e) = adopted {
            if let Err(drop_err) = manager.drop_tablet(self.req.tablet_id, 0, true) {
                tracing::warn!(error = %drop_err, "failed to unregister half cloned tablet");
            }
            return Err(e);
        }

        dir_guard.disarm();
        Ok(())
    }

    /// Make a snapshot on each source in turn and download it into
    /// `local_dir` until one succeeds. Returns whether the snapshot holds
    /// only the missed versions.
    fn make_and_download_snapshots(
        &mut self,
        data_dir: &DataDir,
        local_dir: &Path,
        missed: &[Version],
    ) -> Result<bool> {
        let request = SnapshotRequest::for_clone(
            self.req.tablet_id,
            self.req.schema_hash,
            self.req.version,
            missed,
            self.req.timeout_s.unwrap_or(0),
        );
        let http = HttpClient::new(self.context.config.download_file_max_retry)?;

        let mut last_err = None;
        for src in &self.req.src_backends {
            let snapshot = match self
                .context
                .snapshots
                .make_snapshot(&src.host, src.be_port, &request)
            {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!(
                        host = %src.host,
                        port = src.be_port,
                        tablet_id = self.req.tablet_id,
                        signature = self.req.signature,
                        missed_versions = %format_versions(missed),
                        error = %e,
                        "failed to make snapshot in remote node"
                    );
                    last_err = Some(e);
                    continue;
                }
            };
            tracing::info!(
                host = %src.host,
                port = src.be_port,
                tablet_id = self.req.tablet_id,
                snapshot_path = %snapshot.snapshot_path,
                allow_incremental = snapshot.allow_incremental,
                "made snapshot in remote node"
            );

            let outcome = self
                .download_snapshot(&http, src, &snapshot, data_dir, local_dir)
                .and_then(|stats| {
                    let guards = self.context.engine.snapshot_mgr().convert_rowset_ids(
                        &self.context.engine,
                        local_dir,
                        self.req.tablet_id,
                        self.req.replica_id,
                        self.req.table_id,
                        self.req.partition_id,
                        self.req.schema_hash,
                    )?;
                    Ok((stats, guards))
                });

            if let Err(e) =
                self.context
                    .snapshots
                    .release_snapshot(&src.host, src.be_port, &snapshot.snapshot_path)
            {
                tracing::warn!(
                    host = %src.host,
                    port = src.be_port,
                    snapshot_path = %snapshot.snapshot_path,
                    error = %e,
                    "failed to release snapshot in remote node"
                );
            }

            match outcome {
                Ok((stats, guards)) => {
                    self.copy_stats = stats;
                    self.pending_rs_guards = guards;
                    return Ok(snapshot.allow_incremental);
                }
                Err(e) => {
                    tracing::warn!(
                        host = %src.host,
                        http_port = src.http_port,
                        tablet_id = self.req.tablet_id,
                        error = %e,
                        "failed to download snapshot from remote node"
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            Error::InvalidArgument(format!(
                "clone request of tablet {} has no source backend",
                self.req.tablet_id
            ))
        }))
    }

    fn download_snapshot(
        &self,
        http: &HttpClient,
        src: &SourceBackend,
        snapshot: &RemoteSnapshot,
        data_dir: &DataDir,
        local_dir: &Path,
    ) -> Result<TransferStats> {
        let config = &self.context.config;
        let remote_dir = format!(
            "{}{}/{}/",
            snapshot.snapshot_path, self.req.tablet_id, self.req.schema_hash
        );
        let endpoint = SnapshotFileEndpoint::new(&src.host, src.http_port, &self.context.token);

        let batch = config.enable_batch_download
            && http.supports_batch(&endpoint.batch_check_url()?, config.list_remote_file_timeout());
        let stats = if batch {
            tracing::info!(host = %src.host, remote_dir = %remote_dir, "use batch file download");
            transfer::batch_download_files(data_dir, http, &endpoint, &remote_dir, local_dir, config)?
        } else {
            tracing::info!(
                host = %src.host,
                remote_dir = %remote_dir,
                batch_enabled = config.enable_batch_download,
                "use single file download"
            );
            transfer::download_files(data_dir, http, &endpoint, &remote_dir, local_dir, config)?
        };

        tracing::info!(
            tablet_id = self.req.tablet_id,
            signature = self.req.signature,
            total_files = stats.total_files,
            total_bytes = stats.total_bytes,
            cost_ms = stats.elapsed_ms,
            rate_mb_per_sec = stats.rate_mb_per_sec(),
            "succeed to copy tablet"
        );
        Ok(stats)
    }

    /// Link the staged files into `tablet` and revise its meta
    fn finish_clone(
        &mut self,
        tablet: &TabletSharedPtr,
        clone_dir: &Path,
        version: i64,
        is_incremental: bool,
    ) -> Result<()> {
        self.enter(ClonePhase::LinkFiles);
        let staged = link::link_clone_files(tablet, clone_dir)?;
        if let Some(metas) = &staged.binlog_metas {
            tablet.ingest_binlog_metas(metas)?;
        }

        self.enter(ClonePhase::ReviseMetadata);
        let deleted = {
            let mut permit = tablet.lock_for_mutation();
            if is_incremental {
                finish::finish_incremental_clone(&mut permit, &staged.cloned_meta, version)?;
                Vec::new()
            } else {
                finish::finish_full_clone(&mut permit, &staged.cloned_meta)?
            }
        };

        staged.linked.commit();
        self.context.engine.add_unused_rowsets(deleted);
        Ok(())
    }

    fn report(&mut self, tablet_infos: &mut Vec<TabletInfo>) -> Result<()> {
        self.enter(ClonePhase::Report);
        let manager = self.context.engine.tablet_manager();
        let info = manager.report_tablet_info(self.req.tablet_id)?;

        if info.version < self.req.version {
            if self.is_new_tablet {
                tracing::warn!(
                    tablet_id = self.req.tablet_id,
                    replica_id = self.req.replica_id,
                    version = info.version,
                    expected_version = self.req.version,
                    "begin to drop the stale tablet"
                );
                if let Err(e) = manager.drop_tablet(self.req.tablet_id, self.req.replica_id, false) {
                    tracing::warn!(error = %e, "drop stale cloned tablet failed");
                }
            }
            return Err(Error::Internal(format!(
                "unexpected version. tablet version: {}, expected version: {}",
                info.version, self.req.version
            )));
        }

        tracing::info!(
            tablet_id = self.req.tablet_id,
            schema_hash = self.req.schema_hash,
            replica_id = info.replica_id,
            version = info.version,
            signature = self.req.signature,
            "clone get tablet info success"
        );
        tablet_infos.push(info);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::FileServer;
    use crate::network::{RpcServer, SnapshotClient};
    use crate::tablet::testutil::{tablet_with_versions, write_rowset};
    use crate::tablet::{RowsetId, Tablet};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    const TOKEN: &str = "cluster-token";

    fn v(start: i64, end: i64) -> Version {
        Version::new(start, end)
    }

    /// Records requests and fails every snapshot
    #[derive(Default)]
    struct RecordingService {
        requests: Mutex<Vec<SnapshotRequest>>,
    }

    impl SnapshotService for RecordingService {
        fn make_snapshot(&self, host: &str, _: u16, request: &SnapshotRequest) -> Result<RemoteSnapshot> {
            self.requests.lock().push(request.clone());
            Err(Error::ConnectionFailed {
                address: host.to_string(),
                reason: "refused".into(),
            })
        }

        fn release_snapshot(&self, _: &str, _: u16, _: &str) -> Result<()> {
            Ok(())
        }
    }

    /// Serves snapshots straight from a source engine in this process
    struct LocalSnapshotService {
        source: Arc<StorageEngine>,
        version_override: Option<i64>,
        released: AtomicUsize,
    }

    impl LocalSnapshotService {
        fn new(source: Arc<StorageEngine>) -> Self {
            Self {
                source,
                version_override: None,
                released: AtomicUsize::new(0),
            }
        }
    }

    impl SnapshotService for LocalSnapshotService {
        fn make_snapshot(&self, _: &str, _: u16, request: &SnapshotRequest) -> Result<RemoteSnapshot> {
            let mut request = request.clone();
            if let Some(version) = self.version_override {
                request.version = Some(version);
            }
            let outcome = self
                .source
                .snapshot_mgr()
                .make_snapshot(&self.source, &request)?;
            Ok(RemoteSnapshot {
                snapshot_path: format!("{}/", outcome.snapshot_path.display()),
                allow_incremental: outcome.allow_incremental_clone,
            })
        }

        fn release_snapshot(&self, _: &str, _: u16, snapshot_path: &str) -> Result<()> {
            self.released.fetch_add(1, Ordering::SeqCst);
            self.source
                .snapshot_mgr()
                .release_snapshot(&self.source, snapshot_path)
        }
    }

    fn context(
        engine: &Arc<StorageEngine>,
        service: Arc<dyn SnapshotService>,
        batch: bool,
    ) -> Arc<CloneContext> {
        let config = CloneConfig {
            enable_batch_download: batch,
            download_file_max_retry: 1,
            ..CloneConfig::default()
        };
        Arc::new(CloneContext::new(Arc::clone(engine), service, config, TOKEN))
    }

    fn request(tablet_id: i64, version: i64, http_port: u16) -> CloneRequest {
        let mut req = CloneRequest::new(tablet_id, 1, 100, version);
        req.partition_id = 1;
        req.table_id = 1;
        req.src_backends.push(SourceBackend::new("127.0.0.1", 9, http_port));
        req
    }

    fn run_blocking(context: Arc<CloneContext>, req: CloneRequest) -> (Result<()>, Vec<TabletInfo>) {
        let mut infos = Vec::new();
        let result = EngineCloneTask::new(context, req).execute(&mut infos);
        (result, infos)
    }

    async fn run(context: Arc<CloneContext>, req: CloneRequest) -> (Result<()>, Vec<TabletInfo>) {
        tokio::task::spawn_blocking(move || run_blocking(context, req))
            .await
            .unwrap()
    }

    async fn serve_files(source: &StorageEngine) -> (u16, tokio::sync::watch::Sender<bool>) {
        let server = FileServer::bind("127.0.0.1:0", TOKEN.to_string(), source.snapshot_roots())
            .await
            .unwrap();
        let port = server.local_addr().unwrap().port();
        let shutdown = server.shutdown_handle();
        tokio::spawn(server.serve());
        (port, shutdown)
    }

    fn tablet_files(tablet: &Tablet) -> Vec<String> {
        fs::list_files(tablet.tablet_path()).unwrap()
    }

    fn snapshot_count(engine: &StorageEngine) -> usize {
        engine
            .snapshot_roots()
            .iter()
            .map(|root| std::fs::read_dir(root).map(|d| d.count()).unwrap_or(0))
            .sum()
    }

    #[test]
    fn test_source_backend_parse() {
        let src: SourceBackend = "10.0.0.7:9060:8040".parse().unwrap();
        assert_eq!(src, SourceBackend::new("10.0.0.7", 9060, 8040));
        assert_eq!(src.to_string(), "10.0.0.7:9060:8040");
        assert!("10.0.0.7:9060".parse::<SourceBackend>().is_err());
        assert!(":1:2".parse::<SourceBackend>().is_err());
    }

    #[test]
    fn test_satisfied_replica_is_a_noop() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open_for_test(dir.path());
        let tablet = tablet_with_versions(&engine.data_dirs()[0], 11, &[v(0, 5), v(6, 7)]);
        engine.tablet_manager().add_tablet(Arc::clone(&tablet)).unwrap();
        let files_before = tablet_files(&tablet);

        let service = Arc::new(RecordingService::default());
        let mut req = request(11, 7, 1);
        req.replica_id = 200;
        let (result, infos) = run_blocking(context(&engine, service.clone(), true), req);

        result.unwrap();
        assert!(service.requests.lock().is_empty());
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].version, 7);
        assert_eq!(tablet.replica_id(), 200);
        assert_eq!(tablet_files(&tablet), files_before);
        assert_eq!(tablet.rowset_versions(), vec![v(0, 5), v(6, 7)]);
        assert!(!engine.tablet_manager().is_in_transition(11));
        assert_eq!(engine.tablet_manager().partition_visible_version(1), Some(7));
    }

    #[test]
    fn test_migration_contention_fails_fast() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open_for_test(dir.path());
        let tablet = tablet_with_versions(&engine.data_dirs()[0], 11, &[v(0, 5)]);
        engine.tablet_manager().add_tablet(Arc::clone(&tablet)).unwrap();

        let service = Arc::new(RecordingService::default());
        let _migration = tablet.migration_write();
        let (result, _) = run_blocking(context(&engine, service.clone(), true), request(11, 9, 1));

        let err = result.unwrap_err();
        assert!(matches!(err, Error::TryLockFailed(_)));
        assert!(err.is_retryable());
        assert!(service.requests.lock().is_empty());
        assert!(!engine.tablet_manager().is_in_transition(11));
    }

    #[test]
    fn test_concurrent_clone_is_rejected() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open_for_test(dir.path());
        engine
            .tablet_manager()
            .register_transition_tablet(11, "schema_change")
            .unwrap();

        let service = Arc::new(RecordingService::default());
        let mut task = EngineCloneTask::new(context(&engine, service, true), request(11, 9, 1));
        let err = task.execute(&mut Vec::new()).unwrap_err();
        assert!(matches!(err, Error::TransitionConflict { .. }));
        assert_eq!(task.phase(), ClonePhase::Abort);
        assert!(engine.tablet_manager().is_in_transition(11));
    }

    #[test]
    fn test_merge_on_write_requests_below_pending_publish() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open_for_test(dir.path());
        let data_dir = &engine.data_dirs()[0];
        let tablet_path = data_dir.tablet_path(0, 12, 1);
        let mut meta = TabletMeta::new(12, 1, 100, 1, 1);
        meta.enable_unique_key_merge_on_write = true;
        meta.rs_metas
            .push(write_rowset(&tablet_path, RowsetId::new(1, 1), 12, v(0, 5), b"x"));
        let tablet = Tablet::create(meta, Arc::clone(data_dir), tablet_path).unwrap();
        engine.tablet_manager().add_tablet(tablet).unwrap();
        engine.add_pending_publish(12, 7);

        let service = Arc::new(RecordingService::default());
        let (result, _) = run_blocking(context(&engine, service.clone(), true), request(12, 9, 1));

        assert!(result.unwrap_err().is_retryable());
        let requests = service.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].version, Some(9));
        assert_eq!(requests[0].missing_version, vec![6]);
        assert_eq!(requests[0].is_copy_binlog, Some(true));
        assert_eq!(requests[0].timeout, None);
    }

    #[test]
    fn test_every_source_is_tried() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open_for_test(dir.path());
        let service = Arc::new(RecordingService::default());
        let mut req = request(13, 4, 1);
        req.src_backends.push(SourceBackend::new("127.0.0.2", 9, 1));
        req.timeout_s = Some(30);

        let (result, _) = run_blocking(context(&engine, service.clone(), true), req);
        let err = result.unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed { ref address, .. } if address == "127.0.0.2"));

        let requests = service.requests.lock();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].missing_version.is_empty());
        assert_eq!(requests[0].timeout, Some(30));

        // the failed bootstrap leaves no tablet and no directories behind
        assert!(engine.tablet_manager().get_tablet(13).is_none());
        let data = engine.data_dirs()[0].path().join("data");
        for shard in std::fs::read_dir(&data).unwrap() {
            assert!(!shard.unwrap().path().join("13").exists());
        }
    }

    #[tokio::test]
    async fn test_incremental_clone_fills_missing_versions() {
        let src_dir = tempdir().unwrap();
        let source = StorageEngine::open_for_test(src_dir.path());
        let src_tablet = tablet_with_versions(
            &source.data_dirs()[0],
            30,
            &[v(0, 5), v(6, 7), v(8, 8), v(9, 10)],
        );
        source.tablet_manager().add_tablet(src_tablet).unwrap();

        let dst_dir = tempdir().unwrap();
        let engine = StorageEngine::open_for_test(dst_dir.path());
        let tablet = tablet_with_versions(&engine.data_dirs()[0], 30, &[v(0, 5), v(6, 7)]);
        engine.tablet_manager().add_tablet(Arc::clone(&tablet)).unwrap();
        let max_before = tablet.max_version().unwrap();

        let (port, shutdown) = serve_files(&source).await;
        let service = Arc::new(LocalSnapshotService::new(Arc::clone(&source)));
        let (result, infos) = run(context(&engine, service.clone(), false), request(30, 10, port)).await;

        result.unwrap();
        assert_eq!(
            tablet.rowset_versions(),
            vec![v(0, 5), v(6, 7), v(8, 8), v(9, 10)]
        );
        assert_eq!(tablet.max_version(), Some(v(9, 10)));
        assert!(tablet.max_version().unwrap().end >= max_before.end);
        assert_eq!(infos[0].version, 10);
        assert!(!tablet.tablet_path().join(CLONE_PREFIX).exists());
        assert_eq!(service.released.load(Ordering::SeqCst), 1);
        assert_eq!(snapshot_count(&source), 0);
        assert!(engine.pending_rowsets().is_empty());
        assert_eq!(engine.unused_rowset_count(), 0);

        // every new rowset is backed by linked files
        for rs in tablet.meta().rs_metas {
            for name in rs.segment_file_names() {
                assert!(tablet.tablet_path().join(name).exists());
            }
        }
        let _ = shutdown.send(true);
    }

    #[tokio::test]
    async fn test_full_disk_fails_every_source_without_retry() {
        let src_dir = tempdir().unwrap();
        let source = StorageEngine::open_for_test(src_dir.path());
        let src_tablet = tablet_with_versions(&source.data_dirs()[0], 33, &[v(0, 5)]);
        let big = vec![7u8; 300_000];
        src_tablet
            .add_rowset(write_rowset(
                src_tablet.tablet_path(),
                RowsetId::new(0xb16, 1),
                33,
                v(6, 7),
                &big,
            ))
            .unwrap();
        source.tablet_manager().add_tablet(src_tablet).unwrap();

        let dst_dir = tempdir().unwrap();
        let engine = StorageEngine::open_with_capacity_for_test(dst_dir.path(), 200_000);
        let tablet = tablet_with_versions(&engine.data_dirs()[0], 33, &[v(0, 5)]);
        engine.tablet_manager().add_tablet(Arc::clone(&tablet)).unwrap();
        let files_before = tablet_files(&tablet);

        let (port, shutdown) = serve_files(&source).await;
        let service = Arc::new(LocalSnapshotService::new(Arc::clone(&source)));
        let mut req = request(33, 7, port);
        req.src_backends.push(SourceBackend::new("127.0.0.2", 9, port));
        let (result, infos) = run(context(&engine, service.clone(), true), req).await;

        let err = result.unwrap_err();
        assert!(matches!(err, Error::ExceededLimit { size, .. } if size >= 300_000));
        assert!(infos.is_empty());
        // one snapshot per source, each released after its failed download
        assert_eq!(service.released.load(Ordering::SeqCst), 2);
        assert_eq!(snapshot_count(&source), 0);
        assert!(!tablet.tablet_path().join(CLONE_PREFIX).exists());
        assert_eq!(tablet.rowset_versions(), vec![v(0, 5)]);
        assert_eq!(tablet_files(&tablet), files_before);
        assert!(engine.pending_rowsets().is_empty());
        let _ = shutdown.send(true);
    }

    #[tokio::test]
    async fn test_full_clone_replaces_compacted_range() {
        let src_dir = tempdir().unwrap();
        let source = StorageEngine::open_for_test(src_dir.path());
        let src_tablet = tablet_with_versions(&source.data_dirs()[0], 31, &[v(0, 6)]);
        source.tablet_manager().add_tablet(src_tablet).unwrap();

        let dst_dir = tempdir().unwrap();
        let engine = StorageEngine::open_for_test(dst_dir.path());
        let tablet = tablet_with_versions(&engine.data_dirs()[0], 31, &[v(0, 3), v(5, 5)]);
        engine.tablet_manager().add_tablet(Arc::clone(&tablet)).unwrap();

        let (port, shutdown) = serve_files(&source).await;
        let service = Arc::new(LocalSnapshotService::new(Arc::clone(&source)));
        let (result, infos) = run(context(&engine, service, true), request(31, 6, port)).await;

        result.unwrap();
        assert_eq!(tablet.rowset_versions(), vec![v(0, 6)]);
        assert_eq!(infos[0].version, 6);
        assert_eq!(engine.unused_rowset_count(), 2);
        assert_eq!(
            tablet.cumulative_layer_point(),
            crate::tablet::INVALID_CUMULATIVE_POINT
        );
        let _ = shutdown.send(true);
    }

    #[tokio::test]
    async fn test_bootstrap_stale_tablet_is_dropped() {
        let src_dir = tempdir().unwrap();
        let source = StorageEngine::open_for_test(src_dir.path());
        let src_tablet = tablet_with_versions(&source.data_dirs()[0], 32, &[v(0, 8)]);
        source.tablet_manager().add_tablet(src_tablet).unwrap();

        let dst_dir = tempdir().unwrap();
        let engine = StorageEngine::open_for_test(dst_dir.path());

        let (port, shutdown) = serve_files(&source).await;
        let mut service = LocalSnapshotService::new(Arc::clone(&source));
        service.version_override = Some(8);
        let (result, infos) = run(context(&engine, Arc::new(service), true), request(32, 10, port)).await;

        let err = result.unwrap_err();
        assert!(matches!(err, Error::Internal(ref msg) if msg.contains("unexpected version")));
        assert!(infos.is_empty());
        assert!(engine.tablet_manager().get_tablet(32).is_none());
        let _ = shutdown.send(true);
    }

    #[tokio::test]
    async fn test_end_to_end_bootstrap_between_engines() {
        let src_dir = tempdir().unwrap();
        let source = StorageEngine::open_for_test(src_dir.path());
        let src_tablet =
            tablet_with_versions(&source.data_dirs()[0], 40, &[v(0, 5), v(6, 9), v(10, 10)]);
        source.tablet_manager().add_tablet(src_tablet).unwrap();

        let rpc = RpcServer::bind("127.0.0.1:0", Arc::clone(&source)).await.unwrap();
        let rpc_port = rpc.local_addr().unwrap().port();
        let rpc_shutdown = rpc.shutdown_handle();
        tokio::spawn(rpc.serve());
        let (http_port, http_shutdown) = serve_files(&source).await;

        let dst_dir = tempdir().unwrap();
        let engine = StorageEngine::open_for_test(dst_dir.path());
        // a residue of a failed schema change must be replaced
        let residue = tablet_with_versions(&engine.data_dirs()[0], 40, &[v(0, 1)]);
        residue.set_tablet_state(TabletState::NotReady);
        engine.tablet_manager().add_tablet(residue).unwrap();

        let client = SnapshotClient::new(Duration::from_secs(2), Duration::from_secs(10));
        let mut req = request(40, 10, http_port);
        req.src_backends = vec![
            SourceBackend::new("127.0.0.1", 1, http_port),
            SourceBackend::new("127.0.0.1", rpc_port, http_port),
        ];
        req.replica_id = 555;
        let (result, infos) = run(context(&engine, Arc::new(client), true), req).await;

        result.unwrap();
        let tablet = engine.tablet_manager().get_tablet(40).unwrap();
        assert_eq!(tablet.rowset_versions(), vec![v(0, 5), v(6, 9), v(10, 10)]);
        assert_eq!(tablet.replica_id(), 555);
        assert_eq!(tablet.tablet_state(), TabletState::Running);
        assert_eq!(infos[0].replica_id, 555);
        assert!(!TabletMeta::header_file_path(tablet.tablet_path(), 40).exists());
        assert!(engine.data_dirs()[0].meta_store().get(40, 1).unwrap().is_some());
        assert_eq!(snapshot_count(&source), 0);

        let _ = rpc_shutdown.send(true);
        let _ = http_shutdown.send(true);
    }
}
