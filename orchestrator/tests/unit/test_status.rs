//! Read-only status and log views

use secrecy::ExposeSecret;

use vpsctl::deploy::credentials::CredentialMode;
use vpsctl::deploy::status;
use vpsctl::storage::layout::StorageLayout;

use crate::common::{count_commands, deploy, FakeHost, Fixture};

#[tokio::test]
async fn test_status_of_healthy_deployment() {
    let fx = Fixture::new();
    let host = FakeHost::provisioned(&fx.target, &fx.settings);
    let mut report = deploy(&host, &fx, CredentialMode::Fresh).await;
    assert!(report.error.is_none(), "{:?}", report.error);
    let creds = report.result.take_credentials().unwrap();
    let commands_before = host.state().commands.len();

    let layout = StorageLayout::new(&fx.target, &fx.settings);
    let status = status::collect(&host, &fx.target, &fx.settings, &layout)
        .await
        .unwrap();
    assert!(status.is_healthy());
    assert!(status.port.ours);
    assert!(status.artifact_present);

    let env = status.env.unwrap();
    assert!(env.contains("PGPASSWORD=********"));
    assert!(!env.contains(creds.database_password.expose_secret()));

    // Only probes ran
    let state = host.state();
    let mutating = state.commands[commands_before..]
        .iter()
        .filter(|c| {
            !(c.starts_with("pm2 jlist")
                || c.starts_with("systemctl is-")
                || c.starts_with("psql"))
        })
        .count();
    assert_eq!(mutating, 0);
}

#[tokio::test]
async fn test_status_of_crashed_deployment() {
    let fx = Fixture::new();
    let host = FakeHost::provisioned(&fx.target, &fx.settings);
    assert!(deploy(&host, &fx, CredentialMode::Fresh).await.error.is_none());
    host.crash("finance-tracker");

    let layout = StorageLayout::new(&fx.target, &fx.settings);
    let status = status::collect(&host, &fx.target, &fx.settings, &layout)
        .await
        .unwrap();
    assert!(!status.is_healthy());
    assert_eq!(status.process.status, "errored");
    assert_eq!(status.process.restarts, 10);
    assert!(status.port.owner.is_none());
}

#[tokio::test]
async fn test_status_before_first_deploy() {
    let fx = Fixture::new();
    let host = FakeHost::provisioned(&fx.target, &fx.settings);

    let layout = StorageLayout::new(&fx.target, &fx.settings);
    let status = status::collect(&host, &fx.target, &fx.settings, &layout)
        .await
        .unwrap();
    assert!(!status.process.registered);
    assert!(!status.route_enabled);
    assert!(!status.database_reachable);
    assert!(status.env.is_none());
}

#[tokio::test]
async fn test_logs_mask_secrets() {
    let fx = Fixture::new();
    let host = FakeHost::provisioned(&fx.target, &fx.settings);
    let mut report = deploy(&host, &fx, CredentialMode::Fresh).await;
    assert!(report.error.is_none(), "{:?}", report.error);
    let creds = report.result.take_credentials().unwrap();
    std::fs::write(&fx.settings.proxy.error_log, "upstream prematurely closed\n").unwrap();

    let layout = StorageLayout::new(&fx.target, &fx.settings);
    let text = status::logs(&host, &fx.target, &fx.settings, &layout, 50)
        .await
        .unwrap();
    assert!(text.contains("==> pm2 logs finance-tracker <=="));
    assert!(text.contains("upstream prematurely closed"));
    assert!(text.contains("PGPASSWORD=********"));
    assert!(!text.contains(creds.database_password.expose_secret()));
    assert_eq!(count_commands(&host, "pm2 logs finance-tracker --nostream --lines 50"), 1);
}

#[tokio::test]
async fn test_restart_replaces_process_only() {
    let fx = Fixture::new();
    let host = FakeHost::provisioned(&fx.target, &fx.settings);
    assert!(deploy(&host, &fx, CredentialMode::Fresh).await.error.is_none());
    let before = host.process("finance-tracker").unwrap().pid;
    let reloads = host.state().reloads;

    vpsctl::app::inspect::restart(&host, &fx.target).await.unwrap();

    let after = host.process("finance-tracker").unwrap();
    assert_ne!(after.pid, before);
    assert_eq!(after.status, "online");
    assert_eq!(host.state().reloads, reloads);
    assert_eq!(
        count_commands(&host, "pm2 restart finance-tracker --update-env"),
        1
    );
}

#[tokio::test]
async fn test_restart_requires_registered_process() {
    let fx = Fixture::new();
    let host = FakeHost::provisioned(&fx.target, &fx.settings);

    let err = vpsctl::app::inspect::restart(&host, &fx.target)
        .await
        .unwrap_err();
    assert!(matches!(err, vpsctl::errors::DeployError::NotFound(_)));
}
