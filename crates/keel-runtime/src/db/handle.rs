use futures::future::BoxFuture;
use keel_core::migration::Dialect;
use keel_core::Result;

/// A single open database session.
///
/// Everything the adapter, ledger and runner do goes through this seam, so
/// advisory locks and transactions always stay on one connection. Values
/// cross it as text: parameters are bound as strings and result columns are
/// read back as strings.
pub trait DbHandle: Send {
    /// Dialect of the connected database.
    fn dialect(&self) -> Dialect;

    /// Execute a statement, returning the number of affected rows.
    fn execute<'a>(&'a mut self, sql: &'a str, params: &'a [String]) -> BoxFuture<'a, Result<u64>>;

    /// First row of a query, every column read as text.
    fn fetch_row<'a>(
        &'a mut self,
        sql: &'a str,
        params: &'a [String],
    ) -> BoxFuture<'a, Result<Option<Vec<String>>>>;

    /// First column of the first row.
    fn fetch_text<'a>(
        &'a mut self,
        sql: &'a str,
        params: &'a [String],
    ) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            let row = self.fetch_row(sql, params).await?;
            Ok(row.and_then(|columns| columns.into_iter().next()))
        })
    }
}
