//! Sync orchestration across accounts.
//!
//! Resolves `backend[:account]` selectors against the configuration, opens
//! one backend session per account and drives [`reconcile`] for each.
//! Accounts run one after another; a session that cannot be established is
//! recorded as a fatal outcome for that account and the run moves on.

use anyhow::{bail, Result};
use sqlx::SqlitePool;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::backend::{Backend, ChatBackend, BACKENDS};
use crate::config::Config;
use crate::db;
use crate::error::BackendError;
use crate::migrate;
use crate::models::AccountRef;
use crate::progress::{ProgressMode, SyncProgressReporter};
use crate::reconcile::{reconcile, ReconcileOptions, SyncReport};

/// A parsed `backend[:account]` selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    pub backend: String,
    pub account: Option<String>,
}

impl Selector {
    pub fn parse(s: &str) -> Result<Self> {
        let (backend, account) = match s.split_once(':') {
            Some((backend, account)) => (backend, Some(account)),
            None => (s, None),
        };
        if !BACKENDS.contains(&backend) {
            bail!(
                "Unknown backend: '{}'. Available: {}",
                backend,
                BACKENDS.join(", ")
            );
        }
        Ok(Self {
            backend: backend.to_string(),
            account: account.filter(|a| !a.is_empty()).map(str::to_string),
        })
    }
}

/// Expand selectors into accounts, without duplicates and in selector order.
///
/// No selectors means every configured account. A bare backend selects all
/// of its configured accounts; an explicit account is selected even if it
/// is missing from the configuration so the failure shows up in the report.
pub fn select_accounts(config: &Config, selectors: &[String]) -> Result<Vec<AccountRef>> {
    if selectors.is_empty() {
        return Ok(config.configured_accounts());
    }

    let mut accounts: Vec<AccountRef> = Vec::new();
    for raw in selectors {
        let selector = Selector::parse(raw)?;
        let matched = match &selector.account {
            Some(account) => vec![AccountRef::new(&selector.backend, account)],
            None => config
                .configured_accounts()
                .into_iter()
                .filter(|a| a.backend == selector.backend)
                .collect(),
        };
        if matched.is_empty() {
            warn!("No configured accounts for selector '{}'", raw);
        }
        for account in matched {
            if !accounts.contains(&account) {
                accounts.push(account);
            }
        }
    }
    Ok(accounts)
}

#[derive(Debug, Clone)]
pub struct AccountOutcome {
    pub account: AccountRef,
    /// The account's report, or the account-fatal error that stopped it.
    pub result: Result<SyncReport, String>,
}

/// Per-account outcomes of one sync run.
#[derive(Debug, Clone, Default)]
pub struct AggregateReport {
    pub accounts: Vec<AccountOutcome>,
}

impl AggregateReport {
    /// Sum of every account that completed.
    pub fn totals(&self) -> SyncReport {
        let mut totals = SyncReport::default();
        for outcome in &self.accounts {
            if let Ok(report) = &outcome.result {
                totals.merge(report);
            }
        }
        totals
    }

    pub fn has_fatal_errors(&self) -> bool {
        self.accounts.iter().any(|o| o.result.is_err())
    }

    pub fn fatal_errors(&self) -> impl Iterator<Item = (&AccountRef, &str)> {
        self.accounts.iter().filter_map(|o| match &o.result {
            Err(e) => Some((&o.account, e.as_str())),
            Ok(_) => None,
        })
    }
}

/// Sync the given accounts in order.
///
/// `open` establishes a backend session for an account; its error is
/// recorded as the account's fatal outcome.
pub async fn sync_accounts<B, F, Fut>(
    pool: &SqlitePool,
    accounts: &[AccountRef],
    options: &ReconcileOptions,
    progress: &dyn SyncProgressReporter,
    open: F,
) -> AggregateReport
where
    B: ChatBackend,
    F: Fn(AccountRef) -> Fut,
    Fut: Future<Output = Result<B, BackendError>>,
{
    let mut aggregate = AggregateReport::default();

    for account in accounts {
        if options.stop_requested() {
            warn!("Stopping before account {}", account);
            break;
        }

        info!("Synchronizing {}", account);
        let backend = match open(account.clone()).await {
            Ok(backend) => backend,
            Err(e) => {
                error!("Failed to open session for {}: {}", account, e);
                aggregate.accounts.push(AccountOutcome {
                    account: account.clone(),
                    result: Err(e.to_string()),
                });
                continue;
            }
        };

        let result = reconcile(pool, &backend, account, options, progress)
            .await
            .map_err(|e| {
                error!("{:#}", e);
                format!("{:#}", e)
            });
        aggregate.accounts.push(AccountOutcome {
            account: account.clone(),
            result,
        });
    }

    aggregate
}

/// Run the `sync` command: reconcile the selected accounts and print a
/// summary. Ctrl-C stops the run before the next conversation.
pub async fn run_sync(
    config: &Config,
    selectors: &[String],
    force: bool,
    progress_mode: ProgressMode,
) -> Result<AggregateReport> {
    let accounts = select_accounts(config, selectors)?;
    if accounts.is_empty() {
        warn!("No accounts selected; configure some under [accounts.<backend>.<name>]");
    }

    let pool = db::connect(config).await?;
    migrate::migrate(&pool).await?;

    let stop = Arc::new(AtomicBool::new(false));
    let signal = {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; finishing the current conversation");
                stop.store(true, Ordering::SeqCst);
            }
        })
    };

    let options = ReconcileOptions {
        force,
        stop: Some(stop),
    };
    let reporter = progress_mode.reporter();
    let aggregate = sync_accounts(
        &pool,
        &accounts,
        &options,
        reporter.as_ref(),
        move |account| async move { Backend::open(&account, config).await },
    )
    .await;

    signal.abort();
    pool.close().await;

    print_summary(&aggregate);
    Ok(aggregate)
}

fn print_summary(aggregate: &AggregateReport) {
    for outcome in &aggregate.accounts {
        println!("sync {}", outcome.account);
        match &outcome.result {
            Ok(report) => {
                println!("  conversations synced: {}", report.conversations_synced);
                println!("  conversations added: {}", report.conversations_added);
                println!("  messages added: {}", report.messages_added);
                println!("  contacts added: {}", report.contacts_added);
                if report.conversations_retried > 0 {
                    println!("  conversations retried: {}", report.conversations_retried);
                }
                if report.conversations_skipped > 0 {
                    println!(
                        "  skipped (previous error): {} (use --force to retry)",
                        report.conversations_skipped
                    );
                }
                if report.conversations_failed > 0 {
                    println!("  failed: {}", report.conversations_failed);
                    for failure in &report.failures {
                        println!("    {}: {}", failure.external_id, failure.detail);
                    }
                }
                if report.stopped {
                    println!("  interrupted");
                }
                println!("ok");
            }
            Err(e) => {
                println!("  error: {}", e);
            }
        }
    }

    if aggregate.accounts.len() > 1 {
        let totals = aggregate.totals();
        println!(
            "total: {} conversation(s), {} new message(s), {} skipped, {} failed",
            totals.conversations_synced,
            totals.messages_added,
            totals.conversations_skipped,
            totals.conversations_failed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    fn config() -> Config {
        parse_config(
            r#"
            [accounts.export.personal]
            path = "/tmp/personal"

            [accounts.export.work]
            path = "/tmp/work"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn selector_without_account() {
        let selector = Selector::parse("export").unwrap();
        assert_eq!(selector.backend, "export");
        assert_eq!(selector.account, None);

        let selector = Selector::parse("export:").unwrap();
        assert_eq!(selector.account, None);
    }

    #[test]
    fn unknown_backend_selector_is_rejected() {
        let err = Selector::parse("telegram:main").unwrap_err();
        assert!(err.to_string().contains("Unknown backend"));
    }

    #[test]
    fn empty_selection_means_all_configured() {
        let accounts = select_accounts(&config(), &[]).unwrap();
        assert_eq!(accounts.len(), 2);
    }

    #[test]
    fn selectors_are_deduplicated() {
        let selectors = vec![
            "export:work".to_string(),
            "export".to_string(),
            "export:work".to_string(),
        ];
        let accounts = select_accounts(&config(), &selectors).unwrap();
        assert_eq!(
            accounts,
            vec![
                AccountRef::new("export", "work"),
                AccountRef::new("export", "personal"),
            ]
        );
    }

    #[test]
    fn explicit_unconfigured_account_is_kept() {
        let accounts = select_accounts(&config(), &["export:archive".to_string()]).unwrap();
        assert_eq!(accounts, vec![AccountRef::new("export", "archive")]);
    }
}
