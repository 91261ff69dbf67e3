use std::time::Duration;

use chrono::NaiveDateTime;
use diesel::prelude::*;

use crate::db::DbPool;
use crate::error::{AppError, AppResult};

/// Deletes links (and their IP rows) that expired before `cutoff`.
/// Validity never depends on this running.
///
/// A cutoff in the future is clamped to now, so links that have not
/// expired yet are never touched.
pub fn purge_expired_links(conn: &mut SqliteConnection, cutoff: NaiveDateTime) -> AppResult<usize> {
    use crate::schema::{download_link_ips, download_links};

    let cutoff = cutoff.min(chrono::Utc::now().naive_utc());

    conn.immediate_transaction::<_, AppError, _>(|conn| {
        let stale = download_links::table
            .filter(download_links::expires_at.lt(cutoff))
            .select(download_links::id);

        diesel::delete(
            download_link_ips::table.filter(download_link_ips::download_link_id.eq_any(stale)),
        )
        .execute(conn)?;

        let removed =
            diesel::delete(download_links::table.filter(download_links::expires_at.lt(cutoff)))
                .execute(conn)?;
        Ok(removed)
    })
}

pub fn spawn_reaper(
    pool: DbPool,
    interval: Duration,
    retention: chrono::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;

            let pool = pool.clone();
            let result = tokio::task::spawn_blocking(move || -> AppResult<usize> {
                let mut conn = pool.get()?;
                purge_expired_links(&mut conn, chrono::Utc::now().naive_utc() - retention)
            })
            .await;

            match result {
                Ok(Ok(0)) => {}
                Ok(Ok(removed)) => tracing::info!(removed, "purged expired download links"),
                Ok(Err(e)) => tracing::warn!(error = %e, "expired link purge failed"),
                Err(e) => tracing::error!(error = %e, "expired link purge task panicked"),
            }
        }
    })
}
