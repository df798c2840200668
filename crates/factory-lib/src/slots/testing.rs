//! Slot manager wired to fake backends in a temporary directory

use super::SlotManager;
use crate::backend::runner::testing::ScriptedRunner;
use crate::backend::testing::FakeDrivers;
use crate::clock::testing::ManualClock;
use crate::config::{testing::snapshot, ConfigHandle, ConfigSnapshot};
use crate::images::ImageCache;
use crate::observability::StructuredLogger;
use crate::provision::cgroup::{CgroupManager, CgroupVersion};
use crate::provision::Provisioner;
use crate::store::StateStore;
use std::sync::Arc;
use tempfile::TempDir;

pub const T0: i64 = 1_700_000_000;

pub struct SlotFixture {
    pub dir: TempDir,
    pub fakes: FakeDrivers,
    pub clock: Arc<ManualClock>,
    pub manager: Arc<SlotManager>,
}

/// Every machinetype's root image points at a real file in the fixture
pub fn slot_fixture_with(model: &str, adjust: impl FnOnce(&mut ConfigSnapshot)) -> SlotFixture {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("root.img");
    std::fs::write(&image, b"image").unwrap();
    std::fs::create_dir_all(dir.path().join("cgroup")).unwrap();

    let mut snapshot = snapshot(dir.path(), model);
    for itype in snapshot.machinetypes.values_mut() {
        itype.root_image = image.to_string_lossy().to_string();
    }
    adjust(&mut snapshot);

    let store = StateStore::new(dir.path());
    store.ensure_layout().unwrap();
    let cgroups = Arc::new(CgroupManager::new(
        dir.path().join("cgroup"),
        CgroupVersion::V2,
    ));
    let provisioner = Arc::new(Provisioner::new(Arc::new(ScriptedRunner::new()), cgroups));
    let images = Arc::new(ImageCache::new(store.imagecache_dir()).unwrap());
    let fakes = FakeDrivers::new();
    let clock = Arc::new(ManualClock::new(T0));

    let manager = SlotManager::new(
        ConfigHandle::new(snapshot),
        store,
        fakes.set(),
        provisioner,
        images,
        StructuredLogger::new("host.example.com"),
    )
    .with_clock(clock.clone());

    SlotFixture {
        dir,
        fakes,
        clock,
        manager: Arc::new(manager),
    }
}

pub fn slot_fixture(model: &str) -> SlotFixture {
    slot_fixture_with(model, |_| {})
}
