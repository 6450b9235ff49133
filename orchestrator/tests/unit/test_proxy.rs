//! Reverse proxy route application and certificates

use std::time::Duration;

use vpsctl::app::options::{RunMode, RunOptions};
use vpsctl::app::run::run;
use vpsctl::deploy::credentials::CredentialMode;
use vpsctl::deploy::fsm::{Step, StepState};
use vpsctl::errors::{DeployError, Severity};
use vpsctl::host::Host;
use vpsctl::storage::settings::TlsSettings;

use crate::common::{count_commands, deploy, FakeHost, Fixture};

#[tokio::test]
async fn test_rejected_route_keeps_serving_previous_config() {
    let mut fx = Fixture::new();
    let host = FakeHost::provisioned(&fx.target, &fx.settings);
    assert!(deploy(&host, &fx, CredentialMode::Fresh).await.error.is_none());
    let previous = fx.site().unwrap();

    fx.target.domain = "ledger.example.com".to_string();
    host.state().nginx_rejects = true;

    let report = deploy(&host, &fx, CredentialMode::Preserve).await;
    let err = report.error.expect("deploy should fail");
    assert_eq!(err.step(), Some(Step::Proxy));
    assert_eq!(err.severity(), Severity::Fatal);
    assert!(err.diagnostics().unwrap().contains("proxy_passs"));
    assert_eq!(report.result.state(Step::Verify), Some(&StepState::Pending));

    // Files restored, nginx never reloaded
    assert_eq!(fx.site().unwrap(), previous);
    assert_eq!(host.state().reloads, 1);
    let status = host
        .http_probe("http://127.0.0.1:8080/", None, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(status, 200);
}

#[tokio::test]
async fn test_rejected_route_restores_default_site() {
    let fx = Fixture::new();
    fx.install_default_site();
    let host = FakeHost::provisioned(&fx.target, &fx.settings);
    host.state().nginx_rejects = true;

    let report = deploy(&host, &fx, CredentialMode::Fresh).await;
    assert_eq!(report.error.unwrap().step(), Some(Step::Proxy));

    let enabled = &fx.settings.proxy.sites_enabled;
    assert!(enabled.join("default").exists());
    assert!(std::fs::symlink_metadata(enabled.join("finance-tracker")).is_err());
    assert!(fx.site().is_none());
}

#[tokio::test]
async fn test_abort_during_validation_restores_previous_sites() {
    let fx = Fixture::new();
    fx.install_default_site();
    let host = FakeHost::provisioned(&fx.target, &fx.settings);
    host.state().validate_hangs = true;

    let options = RunOptions {
        mode: RunMode::Deploy {
            credentials: CredentialMode::Fresh,
        },
        log_to_file: false,
    };
    let report = run(
        &host,
        &fx.settings,
        &fx.target,
        &options,
        host.validation_started(),
    )
    .await;
    assert!(matches!(report.error, Some(DeployError::Aborted)));
    assert_eq!(report.result.state(Step::Proxy), Some(&StepState::Failed));

    // The unvalidated route never stays enabled
    let enabled = &fx.settings.proxy.sites_enabled;
    assert!(enabled.join("default").exists());
    assert!(std::fs::symlink_metadata(enabled.join("finance-tracker")).is_err());
    assert!(fx.site().is_none());
    assert_eq!(host.state().reloads, 0);
}

#[tokio::test]
async fn test_failed_reload_is_rolled_back() {
    let fx = Fixture::new();
    let host = FakeHost::provisioned(&fx.target, &fx.settings);
    host.state().reload_fails = true;

    let report = deploy(&host, &fx, CredentialMode::Fresh).await;
    let proxy = report
        .result
        .steps()
        .iter()
        .find(|s| s.step() == Step::Proxy)
        .unwrap();
    assert_eq!(proxy.state(), &StepState::Skipped);
    assert!(proxy.note().unwrap().contains("reload failed"));

    // Validated once, reload attempted twice (apply, then after restore)
    assert_eq!(count_commands(&host, "nginx -t"), 1);
    assert_eq!(count_commands(&host, "systemctl reload nginx"), 2);
    let link = fx.settings.proxy.sites_enabled.join("finance-tracker");
    assert!(std::fs::symlink_metadata(link).is_err());
}

#[tokio::test]
async fn test_certificate_issued_and_https_enabled() {
    let mut fx = Fixture::new();
    fx.target.domain = "ledger.example.com www.ledger.example.com".to_string();
    fx.settings.tls = Some(TlsSettings {
        email: "ops@example.com".to_string(),
        timeout_secs: 60,
    });
    let host = FakeHost::provisioned(&fx.target, &fx.settings);

    let report = deploy(&host, &fx, CredentialMode::Fresh).await;
    assert!(report.error.is_none(), "{:?}", report.error);
    assert_eq!(
        report.result.state(Step::Certificate),
        Some(&StepState::Succeeded)
    );
    assert!(host.state().installed.contains_key("certbot"));
    assert_eq!(
        count_commands(
            &host,
            "certbot certonly --nginx --non-interactive --agree-tos -m ops@example.com -d ledger.example.com"
        ),
        1
    );

    let site = fx.site().unwrap();
    assert!(site.contains("listen 443 ssl"));
    assert!(site.contains("return 301 https://$host$request_uri;"));
    assert!(site.contains("server_name ledger.example.com www.ledger.example.com;"));
    assert_eq!(host.state().reloads, 2);

    // Certificate already present: nothing requested the second time
    let again = deploy(&host, &fx, CredentialMode::Preserve).await;
    assert!(again.error.is_none(), "{:?}", again.error);
    assert_eq!(count_commands(&host, "certbot certonly"), 1);
    assert_eq!(again.result.state(Step::Proxy), Some(&StepState::Skipped));
}

#[tokio::test]
async fn test_certificate_failure_keeps_http_route() {
    let mut fx = Fixture::new();
    fx.target.domain = "ledger.example.com".to_string();
    fx.settings.tls = Some(TlsSettings {
        email: "ops@example.com".to_string(),
        timeout_secs: 60,
    });
    let host = FakeHost::provisioned(&fx.target, &fx.settings);
    host.state()
        .installed
        .insert("certbot".to_string(), "certbot 1.21.0".to_string());
    // A stray file where certbot's live directory belongs makes issuance fail
    std::fs::create_dir_all(&fx.settings.proxy.cert_dir).unwrap();
    std::fs::write(fx.settings.proxy.cert_dir.join("ledger.example.com"), "").unwrap();

    let report = deploy(&host, &fx, CredentialMode::Fresh).await;
    assert!(report.error.is_none(), "{:?}", report.error);
    assert_eq!(
        report.result.state(Step::Certificate),
        Some(&StepState::Skipped)
    );
    let site = fx.site().unwrap();
    assert!(!site.contains("listen 443"));
}
