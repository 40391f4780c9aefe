use serde::Deserialize;
use sqlx::{Row, SqlitePool};
use std::fs;
use std::path::Path;

use crate::RunnerConfig;

/// One active site of a multi-tenant deployment, as stored in the tenant
/// table. Archived and deleted rows are filtered out at the query level and
/// never reach this type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct TenantRecord {
    pub domain: String,
    pub path: String,
}

/// Narrow seam between the trigger pipeline and whatever store holds the
/// tenant table. The pipeline only ever needs the active set.
pub(crate) trait TenantRepository {
    fn list_active_tenants(&self) -> Result<Vec<TenantRecord>, String>;
}

pub(crate) struct SqliteTenantRepository;

impl TenantRepository for SqliteTenantRepository {
    fn list_active_tenants(&self) -> Result<Vec<TenantRecord>, String> {
        crate::with_db(|pool| async move { fetch_active_tenants(&pool).await })
    }
}

// Insertion order (rowid) is the store's natural result order; the summary
// must list sites in the same order the store returns them.
pub(crate) async fn fetch_active_tenants(
    pool: &SqlitePool,
) -> Result<Vec<TenantRecord>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT domain, path FROM tenants WHERE archived = 0 AND deleted = 0 ORDER BY id",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| TenantRecord {
            domain: row.get("domain"),
            path: row.get("path"),
        })
        .collect())
}

/// Resolve the ordered list of base URLs to trigger for this deployment.
///
/// Single-site mode yields exactly one target derived from the configured
/// home URL. Multi-tenant mode yields one target per active tenant row;
/// rows without a domain are skipped, and a tenant path other than "/" is
/// appended to its base URL (subfolder deployments).
pub(crate) fn site_targets(
    cfg: &RunnerConfig,
    repo: &dyn TenantRepository,
) -> Result<Vec<String>, String> {
    if !cfg.multisite {
        return Ok(vec![cfg.home_base_url()]);
    }

    let scheme = cfg.resolved_scheme();
    let mut targets = Vec::new();
    for tenant in repo.list_active_tenants()? {
        if tenant.domain.trim().is_empty() {
            // Skip invalid data.
            continue;
        }

        let mut base_url = format!("{scheme}://{}", tenant.domain);
        if tenant.path != "/" {
            base_url.push_str(&tenant.path);
        }
        targets.push(base_url);
    }

    Ok(targets)
}

/// Row shape accepted by `import-tenants`. Flags default to active.
#[derive(Debug, Deserialize)]
pub(crate) struct TenantSeed {
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub deleted: bool,
}

fn default_path() -> String {
    "/".to_string()
}

pub(crate) fn import_tenants(file: &Path) -> Result<usize, String> {
    let raw = fs::read_to_string(file)
        .map_err(|e| format!("failed to read {}: {e}", file.display()))?;
    let seeds: Vec<TenantSeed> =
        serde_json::from_str(&raw).map_err(|e| format!("invalid tenant JSON: {e}"))?;

    let count = seeds.len();
    crate::with_db(move |pool| async move {
        for seed in seeds {
            upsert_tenant(&pool, &seed).await?;
        }
        Ok(())
    })?;

    Ok(count)
}

/// Seed a small deterministic tenant dataset for demo/dev runs. Repeatable:
/// demo rows are keyed by their demo domains and replaced on each run.
pub(crate) fn seed_demo_tenants() -> Result<(), String> {
    crate::with_db(|pool| async move {
        sqlx::query("DELETE FROM tenants WHERE domain LIKE 'demo-%.example.com'")
            .execute(&pool)
            .await?;

        let rows = [
            ("demo-a.example.com", "/", 0i64, 0i64),
            ("demo-b.example.com", "/blog", 0, 0),
            ("demo-archived.example.com", "/", 1, 0),
            ("demo-deleted.example.com", "/", 0, 1),
        ];
        for (domain, path, archived, deleted) in rows {
            sqlx::query(
                "INSERT INTO tenants (domain, path, archived, deleted) VALUES (?, ?, ?, ?)
                 ON CONFLICT(domain, path) DO UPDATE SET
                   archived = excluded.archived,
                   deleted = excluded.deleted",
            )
            .bind(domain)
            .bind(path)
            .bind(archived)
            .bind(deleted)
            .execute(&pool)
            .await?;
        }

        Ok(())
    })
}

async fn upsert_tenant(pool: &SqlitePool, seed: &TenantSeed) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO tenants (domain, path, archived, deleted) VALUES (?, ?, ?, ?)
         ON CONFLICT(domain, path) DO UPDATE SET
           archived = excluded.archived,
           deleted = excluded.deleted",
    )
    .bind(&seed.domain)
    .bind(&seed.path)
    .bind(seed.archived as i64)
    .bind(seed.deleted as i64)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    struct StubRepository {
        tenants: Vec<TenantRecord>,
    }

    impl TenantRepository for StubRepository {
        fn list_active_tenants(&self) -> Result<Vec<TenantRecord>, String> {
            Ok(self.tenants.clone())
        }
    }

    struct FailingRepository;

    impl TenantRepository for FailingRepository {
        fn list_active_tenants(&self) -> Result<Vec<TenantRecord>, String> {
            Err("tenant store unreachable".to_string())
        }
    }

    fn record(domain: &str, path: &str) -> TenantRecord {
        TenantRecord {
            domain: domain.to_string(),
            path: path.to_string(),
        }
    }

    fn multisite_cfg() -> RunnerConfig {
        RunnerConfig {
            scheme: None,
            multisite: true,
            home_url: "network.example.com".to_string(),
            auth_user: None,
            auth_pw: None,
            basic_auth_user: None,
            basic_auth_password: None,
            basic_auth_password_hash: None,
        }
    }

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::MIGRATOR.run(&pool).await.unwrap();
        pool
    }

    async fn insert_tenant(pool: &SqlitePool, domain: &str, path: &str, archived: i64, deleted: i64) {
        sqlx::query("INSERT INTO tenants (domain, path, archived, deleted) VALUES (?, ?, ?, ?)")
            .bind(domain)
            .bind(path)
            .bind(archived)
            .bind(deleted)
            .execute(pool)
            .await
            .unwrap();
    }

    #[test]
    fn single_site_mode_yields_exactly_one_target() {
        let mut cfg = multisite_cfg();
        cfg.multisite = false;

        let repo = FailingRepository;
        // The repository must not even be consulted in single-site mode.
        let targets = site_targets(&cfg, &repo).unwrap();
        assert_eq!(targets, vec!["https://network.example.com".to_string()]);
    }

    #[test]
    fn multisite_skips_empty_domains_and_appends_subfolder_paths() {
        let repo = StubRepository {
            tenants: vec![
                record("a.com", "/"),
                record("", "/"),
                record("b.com", "/s"),
            ],
        };

        let targets = site_targets(&multisite_cfg(), &repo).unwrap();
        assert_eq!(
            targets,
            vec!["https://a.com".to_string(), "https://b.com/s".to_string()]
        );
    }

    #[test]
    fn multisite_respects_scheme_override() {
        let mut cfg = multisite_cfg();
        cfg.scheme = Some("http".to_string());
        let repo = StubRepository {
            tenants: vec![record("a.com", "/")],
        };

        assert_eq!(
            site_targets(&cfg, &repo).unwrap(),
            vec!["http://a.com".to_string()]
        );
    }

    #[test]
    fn repository_error_aborts_enumeration() {
        let err = site_targets(&multisite_cfg(), &FailingRepository).unwrap_err();
        assert_eq!(err, "tenant store unreachable");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fetch_filters_archived_and_deleted_rows() {
        let pool = test_pool().await;
        insert_tenant(&pool, "a.com", "/", 0, 0).await;
        insert_tenant(&pool, "archived.com", "/", 1, 0).await;
        insert_tenant(&pool, "deleted.com", "/", 0, 1).await;
        insert_tenant(&pool, "b.com", "/s", 0, 0).await;

        let tenants = fetch_active_tenants(&pool).await.unwrap();
        assert_eq!(tenants, vec![record("a.com", "/"), record("b.com", "/s")]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fetch_preserves_insertion_order() {
        let pool = test_pool().await;
        // Deliberately out of lexicographic order.
        insert_tenant(&pool, "z.com", "/", 0, 0).await;
        insert_tenant(&pool, "a.com", "/", 0, 0).await;
        insert_tenant(&pool, "m.com", "/", 0, 0).await;

        let domains: Vec<String> = fetch_active_tenants(&pool)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.domain)
            .collect();
        assert_eq!(domains, vec!["z.com", "a.com", "m.com"]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn upsert_replaces_flags_for_existing_domain_path() {
        let pool = test_pool().await;
        insert_tenant(&pool, "a.com", "/", 0, 0).await;

        let seed = TenantSeed {
            domain: "a.com".to_string(),
            path: "/".to_string(),
            archived: true,
            deleted: false,
        };
        upsert_tenant(&pool, &seed).await.unwrap();

        let tenants = fetch_active_tenants(&pool).await.unwrap();
        assert!(tenants.is_empty(), "archived row must disappear from the active set");
    }

    #[test]
    fn tenant_seed_defaults() {
        let seeds: Vec<TenantSeed> =
            serde_json::from_str(r#"[{"domain":"a.com"}]"#).unwrap();
        assert_eq!(seeds[0].path, "/");
        assert!(!seeds[0].archived);
        assert!(!seeds[0].deleted);
    }
}
