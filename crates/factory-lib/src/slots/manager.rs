use super::features::{write_features, FeatureInputs};
use super::state::{derive_state, needs_liveness, Observation};
use crate::backend::{DriverSet, LaunchSpec, Liveness};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigHandle, ConfigSnapshot, InstanceType};
use crate::error::{FactoryError, Result};
use crate::images::ImageCache;
use crate::models::{LogicalMachine, MachineState, ShutdownMessage, SlotRecord};
use crate::observability::{FactoryMetrics, StructuredLogger};
use crate::provision::{AllocationRequest, Provisioner};
use crate::store::{files, mtime_secs, FinishRecord, HeartbeatRecord, MachineDir, StateStore};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shutdown codes written by the factory itself
pub mod codes {
    pub const WALLCLOCK: (u16, &str) = (700, "Passed max wall clock");
    pub const HEARTBEAT: (u16, &str) = (700, "Heartbeat file too old");
    pub const CREATE_FAILED: (u16, &str) = (700, "Failed to create instance");
    pub const STUCK_STARTING: (u16, &str) = (700, "Instance never started");
}

/// A slot still Starting after this long was abandoned by an earlier run
pub const STARTING_TIMEOUT_SECS: i64 = 3600;

/// Outcome of one monitor pass
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MonitorReport {
    pub heartbeats: usize,
    /// Running slots destroyed for exceeding a limit
    pub destroyed: Vec<String>,
    /// Slots whose backend instance was found gone and which were finalised
    pub finalized: Vec<String>,
    pub paused: Vec<String>,
    pub failures: usize,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
}

/// CPU use since `baseline` as a percentage of one processor
///
/// Zero when no time has passed or the counter went backwards.
pub fn cpu_percentage(baseline: Option<(i64, f64)>, cpu_seconds: f64, now: i64) -> f64 {
    let Some((then, before)) = baseline else {
        return 0.0;
    };
    let elapsed = now - then;
    let delta = cpu_seconds - before;
    if elapsed <= 0 || !(delta > 0.0) {
        return 0.0;
    }
    let percentage = 100.0 * delta / elapsed as f64;
    if percentage.is_finite() {
        percentage
    } else {
        0.0
    }
}

/// Owns the lifecycle of every slot on this host
pub struct SlotManager {
    config: ConfigHandle,
    store: StateStore,
    drivers: DriverSet,
    provisioner: Arc<Provisioner>,
    images: Arc<ImageCache>,
    clock: Arc<dyn Clock>,
    logger: StructuredLogger,
    metrics: FactoryMetrics,
}

impl SlotManager {
    pub fn new(
        config: ConfigHandle,
        store: StateStore,
        drivers: DriverSet,
        provisioner: Arc<Provisioner>,
        images: Arc<ImageCache>,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            config,
            store,
            drivers,
            provisioner,
            images,
            clock: Arc::new(SystemClock),
            logger,
            metrics: FactoryMetrics::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn drivers(&self) -> &DriverSet {
        &self.drivers
    }

    pub fn provisioner(&self) -> &Arc<Provisioner> {
        &self.provisioner
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.logger
    }

    /// Start a new instance of `machinetype` in slot `ordinal`
    ///
    /// The slot record is written before anything is provisioned, so the
    /// slot reads as Starting for the whole attempt. Any failure releases
    /// what was provisioned and leaves the slot in Shutdown.
    pub async fn create(
        &self,
        ordinal: usize,
        machinetype: &str,
        processors: u32,
        shutdown_deadline: i64,
    ) -> Result<LogicalMachine> {
        let snapshot = self.config.current().await;
        if ordinal >= snapshot.num_slots {
            return Err(FactoryError::Config(format!(
                "slot {} out of range, factory has {} slots",
                ordinal, snapshot.num_slots
            )));
        }
        let hostname = snapshot.hostname(ordinal);

        let itype = match snapshot.machinetype(machinetype) {
            Ok(itype) => itype.clone(),
            Err(e) => {
                self.logger.log_slot_create_failed(&hostname, machinetype, &e);
                self.metrics.inc_slot_create_failures(e.category());
                return Err(e);
            }
        };
        if processors < itype.min_processors || processors > itype.max_processors {
            return Err(FactoryError::Config(format!(
                "machinetype {} takes {}..={} processors, not {}",
                itype.name, itype.min_processors, itype.max_processors, processors
            )));
        }

        let current = self.machine(ordinal).await;
        if !current.state.is_idle() {
            return Err(FactoryError::SlotBusy(hostname));
        }
        if current.created.is_some() && current.finished.is_none() {
            // The previous instance vanished without being finalised
            info!(slot = %hostname, "Finalising previous instance before reuse");
            self.destroy(ordinal, None).await?;
        }

        let now = self.clock.now();
        // Never reuse a directory name within the same second
        let created = match self.store.read_slot_record(&hostname) {
            Some(previous) if previous.created >= now => previous.created + 1,
            _ => now,
        };
        let record = SlotRecord {
            created,
            machinetype: itype.name.clone(),
            model: itype.model,
        };
        let dir = self.store.machine_dir(&hostname, &record);
        dir.create()?;
        self.store.write_slot_record(&hostname, &record)?;

        let deadline = shutdown_deadline.min(created + itype.max_wallclock_seconds);
        let launch = Launch {
            snapshot: &snapshot,
            ordinal,
            hostname: &hostname,
            itype: &itype,
            processors,
            deadline,
            record: &record,
            dir: &dir,
        };

        match self.launch(&launch).await {
            Ok(instance_id) => {
                self.logger.log_slot_created(
                    &hostname,
                    &itype.name,
                    itype.model,
                    processors,
                    &instance_id,
                );
                self.metrics.inc_slots_created();
                Ok(self.machine(ordinal).await)
            }
            Err(e) => {
                self.logger.log_slot_create_failed(&hostname, &itype.name, &e);
                self.metrics.inc_slot_create_failures(e.category());
                self.abandon(&launch, &e).await;
                Err(e)
            }
        }
    }

    async fn launch(&self, launch: &Launch<'_>) -> Result<String> {
        let Launch {
            snapshot,
            ordinal,
            hostname,
            itype,
            processors,
            deadline,
            record,
            dir,
        } = *launch;
        let memory_mb = snapshot.mb_per_processor * u64::from(processors);

        dir.write_value(files::MODEL, itype.model)?;
        dir.write_value(files::PROCESSORS, processors)?;
        dir.write_value(files::MEMORY_MB, memory_mb)?;
        dir.write_value(files::SHUTDOWN_DEADLINE, deadline)?;
        if let Some(fqan) = &itype.accounting_fqan {
            dir.write_value(files::ACCOUNTING_FQAN, fqan)?;
        }

        let image = self.images.resolve(&itype.root_image).await?;
        let allocation = self
            .provisioner
            .allocate(
                snapshot,
                &AllocationRequest {
                    hostname,
                    ordinal,
                    model: itype.model,
                    processors,
                    image: &image,
                    machine_dir: dir.path(),
                },
            )
            .await?;
        if let Some(ip) = allocation.network.ip {
            dir.write_value(files::IP, ip)?;
        }
        if let Some(bytes) = allocation.volume_bytes {
            dir.write_value(files::DISK_BYTES, bytes)?;
        }

        write_features(
            dir,
            &FeatureInputs {
                processors,
                mb_per_processor: snapshot.mb_per_processor,
                created: record.created,
                shutdown_deadline: deadline,
                max_wallclock_seconds: itype.max_wallclock_seconds,
                grace_secs: snapshot.shutdown_grace.as_secs(),
                hs06_per_processor: itype.hs06_per_processor,
                scratch_bytes: allocation.volume_bytes,
            },
        )?;

        let spec = LaunchSpec {
            hostname: hostname.to_string(),
            space: snapshot.space.clone(),
            factory: snapshot.factory_name.clone(),
            machinetype: itype.name.clone(),
            model: itype.model,
            processors,
            memory_mb,
            uuid: uuid::Uuid::new_v4().to_string(),
            image,
            command: itype.container_command.clone(),
            machine_dir: dir.path().to_path_buf(),
            network_mode: snapshot.network.clone(),
            allocation: allocation.clone(),
        };
        let instance_id = self.drivers.for_model(itype.model).start(&spec).await?;
        dir.write_value(files::UUID, &instance_id)?;

        if let Err(e) = self.provisioner.discard_disks(&allocation) {
            warn!(slot = %hostname, error = %e, "Failed to discard disk overlay");
        }
        dir.write_value(files::STARTED, self.clock.now())?;
        Ok(instance_id)
    }

    /// Undo a failed creation, leaving the slot in Shutdown
    async fn abandon(&self, launch: &Launch<'_>, error: &FactoryError) {
        let hostname = launch.hostname;
        if matches!(error, FactoryError::Backend { .. }) {
            let driver = self.drivers.for_model(launch.itype.model);
            if let Err(e) = driver.stop(hostname, launch.dir.uuid().as_deref()).await {
                warn!(slot = %hostname, error = %e, "Failed to stop instance after failed start");
            }
        }
        if let Err(e) = self
            .provisioner
            .release(launch.snapshot, hostname, Some(launch.dir.path()))
            .await
        {
            warn!(slot = %hostname, error = %e, "Failed to release resources after failed start");
        }

        let now = self.clock.now();
        let (code, text) = codes::CREATE_FAILED;
        let message = ShutdownMessage::new(code, format!("{} ({})", text, error.category()));
        if let Err(e) = launch.dir.write_shutdown_message_once(&message, now) {
            warn!(slot = %hostname, error = %e, "Failed to record shutdown message");
        }
        if let Err(e) = self.finalize(hostname, launch.record, launch.dir, now) {
            warn!(slot = %hostname, error = %e, "Failed to mark failed instance finished");
        }
    }

    /// Stop the slot's instance and release everything it holds
    ///
    /// Safe to repeat: a gone instance, released resources and an existing
    /// shutdown message are all left as they are.
    pub async fn destroy(&self, ordinal: usize, message: Option<ShutdownMessage>) -> Result<()> {
        let snapshot = self.config.current().await;
        let hostname = snapshot.hostname(ordinal);

        let Some((record, dir)) = self.store.current_machine_dir(&hostname) else {
            if let Err(e) = self.provisioner.release(&snapshot, &hostname, None).await {
                warn!(slot = %hostname, error = %e, "Failed to release resources of untracked slot");
            }
            return Ok(());
        };

        let driver = self.drivers.for_model(record.model);
        if let Err(e) = driver.stop(&hostname, dir.uuid().as_deref()).await {
            warn!(slot = %hostname, error = %e, "Stop failed, releasing resources anyway");
        }
        if let Err(e) = self
            .provisioner
            .release(&snapshot, &hostname, Some(dir.path()))
            .await
        {
            warn!(slot = %hostname, error = %e, "Failed to release resources");
        }

        let now = self.clock.now();
        if let Some(message) = &message {
            dir.write_shutdown_message_once(message, now)?;
        }
        if self.finalize(&hostname, &record, &dir, now)? {
            self.logger
                .log_slot_destroyed(&hostname, &record.machinetype, dir.shutdown_message().as_ref());
            self.metrics.inc_slots_destroyed();
        }
        Ok(())
    }

    /// Write the finished marker and finishes record once
    ///
    /// A shutdown message left by the instance in `joboutputs` is adopted
    /// unless the factory already recorded one.
    fn finalize(
        &self,
        hostname: &str,
        record: &SlotRecord,
        dir: &MachineDir,
        now: i64,
    ) -> Result<bool> {
        if dir.finished().is_some() {
            return Ok(false);
        }

        let guest = dir.file(files::JOBOUTPUTS).join(files::SHUTDOWN_MESSAGE);
        if let Some(message) = std::fs::read_to_string(&guest)
            .ok()
            .and_then(|content| ShutdownMessage::parse(&content))
        {
            let time = mtime_secs(&guest).unwrap_or(now);
            dir.write_shutdown_message_once(&message, time)?;
        }

        dir.write_value(files::FINISHED, now)?;
        self.store.write_finish(&FinishRecord {
            created: record.created,
            machinetype: record.machinetype.clone(),
            hostname: hostname.to_string(),
        })?;
        Ok(true)
    }

    /// Record CPU use of a running instance
    ///
    /// Returns `None` when the slot has no started instance. Without backend
    /// accounting the previous CPU time is carried forward, so the instance
    /// still shows a fresh heartbeat.
    pub async fn heartbeat(&self, ordinal: usize) -> Result<Option<HeartbeatRecord>> {
        let snapshot = self.config.current().await;
        let hostname = snapshot.hostname(ordinal);

        let Some((record, dir)) = self.store.current_machine_dir(&hostname) else {
            return Ok(None);
        };
        let (Some(started), None, Some(instance_id)) = (dir.started(), dir.finished(), dir.uuid())
        else {
            return Ok(None);
        };

        let driver = self.drivers.for_model(record.model);
        let previous = dir.heartbeat();
        let cpu_seconds = match driver.cpu_seconds(&hostname, &instance_id).await? {
            Some(seconds) => seconds,
            None => {
                debug!(slot = %hostname, "No CPU accounting available");
                previous.as_ref().map_or(0.0, |h| h.cpu_seconds as f64)
            }
        };

        let now = self.clock.now();
        let baseline = previous
            .map(|h| (h.time, h.cpu_seconds as f64))
            .or(Some((started, 0.0)));
        let heartbeat = HeartbeatRecord {
            time: now,
            cpu_seconds: cpu_seconds.max(0.0) as u64,
            cpu_percentage: cpu_percentage(baseline, cpu_seconds, now),
        };
        dir.write_heartbeat(&heartbeat)?;

        self.logger
            .log_heartbeat(&hostname, heartbeat.cpu_seconds, heartbeat.cpu_percentage);
        self.metrics.inc_heartbeats_recorded();
        Ok(Some(heartbeat))
    }

    /// Current view of slot `ordinal`
    pub async fn machine(&self, ordinal: usize) -> LogicalMachine {
        let snapshot = self.config.current().await;
        self.observe(ordinal, &snapshot.hostname(ordinal)).await
    }

    /// Current view of every slot, by ordinal
    pub async fn machines(&self) -> Vec<LogicalMachine> {
        let snapshot = self.config.current().await;
        let mut machines = Vec::with_capacity(snapshot.num_slots);
        for (ordinal, hostname) in snapshot.hostnames().iter().enumerate() {
            machines.push(self.observe(ordinal, hostname).await);
        }
        machines
    }

    async fn observe(&self, ordinal: usize, hostname: &str) -> LogicalMachine {
        let mut machine = LogicalMachine::unknown(ordinal, hostname);
        let Some(record) = self.store.read_slot_record(hostname) else {
            return machine;
        };
        let dir = self.store.machine_dir(hostname, &record);

        machine.model = Some(record.model);
        machine.machinetype = Some(record.machinetype.clone());
        machine.created = Some(record.created);

        let mut obs = Observation {
            created: Some(record.created),
            dir_exists: dir.exists(),
            ..Default::default()
        };
        if obs.dir_exists {
            obs.started = dir.started();
            obs.finished = dir.finished();
            fill_from_dir(&mut machine, &dir);
        }

        if needs_liveness(&obs) {
            let liveness = match &machine.uuid {
                None => Liveness::Gone,
                Some(id) => {
                    let driver = self.drivers.for_model(record.model);
                    match driver.liveness(hostname, id).await {
                        Ok(liveness) => liveness,
                        Err(e) => {
                            // Unsure means alive: never finalise on a failed query
                            warn!(slot = %hostname, error = %e, "Liveness check failed");
                            Liveness::Running
                        }
                    }
                }
            };
            if let Liveness::Paused(detail) = &liveness {
                debug!(slot = %hostname, detail = %detail, "Backend reports instance paused");
            }
            obs.liveness = Some(liveness);
        }

        machine.state = derive_state(&obs);
        machine
    }

    /// Enforce limits, record heartbeats and finalise vanished instances
    pub async fn monitor(&self) -> MonitorReport {
        let snapshot = self.config.current().await;
        let mut report = MonitorReport::default();

        for machine in self.machines().await {
            let now = self.clock.now();
            if let Err(e) = self.monitor_one(&snapshot, &machine, now, &mut report).await {
                warn!(slot = %machine.hostname, error = %e, "Monitor failed for slot");
                report.failures += 1;
            }
        }
        report
    }

    async fn monitor_one(
        &self,
        snapshot: &ConfigSnapshot,
        machine: &LogicalMachine,
        now: i64,
        report: &mut MonitorReport,
    ) -> Result<()> {
        match machine.state {
            MachineState::Running => {
                let itype = machine
                    .machinetype
                    .as_deref()
                    .and_then(|name| snapshot.machinetypes.get(name));

                let limit = if machine.shutdown_deadline.is_some_and(|d| now > d) {
                    Some(codes::WALLCLOCK)
                } else if itype.is_some_and(|t| heartbeat_file_stale(t, machine, now)) {
                    Some(codes::HEARTBEAT)
                } else {
                    None
                };

                match limit {
                    Some((code, text)) => {
                        info!(slot = %machine.hostname, reason = %text, "Destroying instance");
                        self.destroy(machine.ordinal, Some(ShutdownMessage::new(code, text)))
                            .await?;
                        report.destroyed.push(machine.hostname.clone());
                    }
                    None => {
                        if self.heartbeat(machine.ordinal).await?.is_some() {
                            report.heartbeats += 1;
                        }
                    }
                }
            }
            MachineState::Starting
                if machine
                    .created
                    .is_some_and(|created| now - created > STARTING_TIMEOUT_SECS) =>
            {
                let (code, text) = codes::STUCK_STARTING;
                warn!(slot = %machine.hostname, "Slot stuck starting, abandoning it");
                self.destroy(machine.ordinal, Some(ShutdownMessage::new(code, text)))
                    .await?;
                report.finalized.push(machine.hostname.clone());
            }
            MachineState::Shutdown if machine.finished.is_none() => {
                info!(slot = %machine.hostname, "Instance gone, finalising slot");
                self.destroy(machine.ordinal, None).await?;
                report.finalized.push(machine.hostname.clone());
            }
            MachineState::Paused => {
                self.logger.log_slot_paused(&machine.hostname, "backend reports paused");
                report.paused.push(machine.hostname.clone());
            }
            _ => {}
        }
        Ok(())
    }

    /// Delete finished machine directories past their retention window
    ///
    /// The directory a slot record currently points to is always kept.
    pub async fn cleanup(&self) -> Result<CleanupReport> {
        let snapshot = self.config.current().await;
        let now = self.clock.now();

        let live: HashSet<PathBuf> = snapshot
            .hostnames()
            .iter()
            .filter_map(|hostname| {
                self.store
                    .read_slot_record(hostname)
                    .map(|record| self.store.machine_dir(hostname, &record).path().to_path_buf())
            })
            .collect();

        let mut report = CleanupReport::default();
        for entry in self.store.list_machine_dirs()? {
            if live.contains(entry.dir.path()) {
                continue;
            }
            let ended = entry.dir.finished().unwrap_or(entry.created);
            if now - ended > snapshot.retention_secs(&entry.machinetype) {
                entry.dir.remove()?;
                debug!(dir = %entry.dir.path().display(), "Removed expired machine directory");
                report.removed.push(entry.dir.path().to_path_buf());
            }
        }
        Ok(report)
    }
}

/// Borrowed context of one creation attempt
#[derive(Clone, Copy)]
struct Launch<'a> {
    snapshot: &'a ConfigSnapshot,
    ordinal: usize,
    hostname: &'a str,
    itype: &'a InstanceType,
    processors: u32,
    deadline: i64,
    record: &'a SlotRecord,
    dir: &'a MachineDir,
}

fn fill_from_dir(machine: &mut LogicalMachine, dir: &MachineDir) {
    machine.started = dir.started();
    machine.finished = dir.finished();
    machine.uuid = dir.uuid();
    machine.processors = dir
        .read_u64(files::PROCESSORS)
        .and_then(|p| u32::try_from(p).ok())
        .unwrap_or(0);
    machine.memory_mb = dir.read_u64(files::MEMORY_MB).unwrap_or(0);
    if let Some(heartbeat) = dir.heartbeat() {
        machine.heartbeat = Some(heartbeat.time);
        machine.cpu_seconds = heartbeat.cpu_seconds;
        machine.cpu_percentage = heartbeat.cpu_percentage;
    }
    machine.ip = dir.ip();
    machine.shutdown_deadline = dir.read_i64(files::SHUTDOWN_DEADLINE);
    machine.shutdown_message = dir.shutdown_message();
    machine.shutdown_time = dir.read_i64(files::SHUTDOWN_TIME);
    machine.machine_dir = Some(dir.path().to_path_buf());
}

/// The instance's own heartbeat file has not been touched for too long
///
/// Instances get `heartbeat_seconds` after starting before the file must
/// exist.
fn heartbeat_file_stale(itype: &InstanceType, machine: &LogicalMachine, now: i64) -> bool {
    let (Some(name), Some(started), Some(dir)) =
        (&itype.heartbeat_file, machine.started, &machine.machine_dir)
    else {
        return false;
    };
    if itype.heartbeat_seconds <= 0 || now - started <= itype.heartbeat_seconds {
        return false;
    }
    match mtime_secs(&dir.join(files::JOBOUTPUTS).join(name)) {
        Some(touched) => now - touched > itype.heartbeat_seconds,
        None => true,
    }
}
