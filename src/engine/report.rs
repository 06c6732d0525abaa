use super::IterationReport;
use crate::errors::Error;

impl<T> IterationReport<T> {
    /// Items whose operation succeeded, in original dispatch order.
    pub fn into_successes(self) -> Vec<T> {
        self.results
            .into_iter()
            .filter_map(|(item, result)| result.is_ok().then_some(item))
            .collect()
    }

    /// The first recorded failure, if any.
    pub fn into_first_error(self) -> Option<Error> {
        self.results.into_iter().find_map(|(_, result)| result.err())
    }
}
