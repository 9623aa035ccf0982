//! Shared harness for integration tests: a temporary data root, a wired
//! supervisor, and a fake `java` that behaves like a line-oriented game
//! server (echoes input, honors `stop`, exits cleanly).

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use craftvisor::config::Config;
use craftvisor::console::ConsoleFabric;
use craftvisor::lifecycle::{ImportSpec, Supervisor, UpdateSpec};
use craftvisor::platform::{self, Platform};
use craftvisor::store::{Distribution, ServerRecord, Store};

pub struct Harness {
    /// Keeps the data root alive for the test's duration.
    pub tmp: TempDir,
    pub cfg: Config,
    pub store: Arc<Store>,
    pub platform: Arc<dyn Platform>,
    pub fabric: Arc<ConsoleFabric>,
    pub supervisor: Arc<Supervisor>,
}

pub async fn harness() -> Harness {
    let tmp = TempDir::new().expect("create temp dir");
    let cfg = Config {
        data_root: tmp.path().join("msm"),
        ..Config::default()
    };
    std::fs::create_dir_all(&cfg.data_root).unwrap();

    let store = Arc::new(Store::open(&cfg.database_path()).expect("open store"));
    let platform = platform::select();
    let fabric = ConsoleFabric::new(cfg.fabric());
    let supervisor = Supervisor::new(
        cfg.clone(),
        Arc::clone(&store),
        Arc::clone(&platform),
        Arc::clone(&fabric),
    )
    .await;

    Harness {
        tmp,
        cfg,
        store,
        platform,
        fabric,
        supervisor,
    }
}

/// Writes a fake `java` script into `dir` and returns its path. The script
/// prints a banner, echoes every stdin line, and exits on `stop`.
#[cfg(unix)]
pub fn write_java_shim(dir: &std::path::Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let bin = dir.join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    // Named `java` so process-table ownership checks recognize it.
    let shim = bin.join("java");
    std::fs::write(
        &shim,
        "#!/bin/sh\n\
         echo \"Starting test server\"\n\
         while read line; do\n\
         \x20 echo \"got: $line\"\n\
         \x20 if [ \"$line\" = \"stop\" ]; then\n\
         \x20   echo \"Stopping server\"\n\
         \x20   exit 0\n\
         \x20 fi\n\
         done\n",
    )
    .unwrap();
    std::fs::set_permissions(&shim, std::fs::Permissions::from_mode(0o755)).unwrap();
    shim
}

/// Picks a TCP port that was free a moment ago.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    listener.local_addr().unwrap().port()
}

/// Creates a ready-to-start server: working directory under the data root,
/// a `server.jar`, an accepted EULA, the shim as its runtime, and a port
/// that is free.
#[cfg(unix)]
pub async fn provision_server(harness: &Harness, name: &str) -> ServerRecord {
    let dir = harness.cfg.data_root.join("servers").join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("server.jar"), b"not a real jar").unwrap();
    std::fs::write(dir.join("eula.txt"), "eula=true\n").unwrap();

    let shim = write_java_shim(harness.tmp.path());
    let record = harness
        .supervisor
        .import(ImportSpec {
            name: name.to_string(),
            distribution: Distribution::Vanilla,
            version: "1.20.4".to_string(),
            path: dir,
            memory: Some("1G".to_string()),
            port: Some(free_port()),
        })
        .await
        .expect("import server");

    harness
        .supervisor
        .update(
            record.id,
            UpdateSpec {
                java_path: Some(shim.to_string_lossy().into_owned()),
                ..UpdateSpec::default()
            },
        )
        .await
        .expect("set java path")
}
