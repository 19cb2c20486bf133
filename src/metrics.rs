//! 書き込みディスパッチャのメトリクス。

use prometrics::metrics::{Counter, CounterBuilder};

use crate::Result;

#[derive(Debug, Clone)]
pub struct DispatcherMetrics {
    pub(crate) writes_total: Counter,
    pub(crate) failures_total: Counter,
    pub(crate) lost_shares_total: Counter,
    pub(crate) handoffs_total: Counter,
    pub(crate) rolled_back_shares_total: Counter,
}
impl DispatcherMetrics {
    pub(crate) fn new() -> Result<Self> {
        let writes_total = track!(CounterBuilder::new("writes_total")
            .namespace("nimbusio")
            .subsystem("dispatcher")
            .help("Number of dispatched object writes")
            .default_registry()
            .finish())?;
        let failures_total = track!(CounterBuilder::new("failures_total")
            .namespace("nimbusio")
            .subsystem("dispatcher")
            .help("Number of object writes which did not reach the write quorum")
            .default_registry()
            .finish())?;
        let lost_shares_total = track!(CounterBuilder::new("lost_shares_total")
            .namespace("nimbusio")
            .subsystem("dispatcher")
            .help("Number of shares which could not be placed or finalized")
            .default_registry()
            .finish())?;
        let handoffs_total = track!(CounterBuilder::new("handoffs_total")
            .namespace("nimbusio")
            .subsystem("dispatcher")
            .help("Number of shares rerouted to handoff nodes")
            .default_registry()
            .finish())?;
        let rolled_back_shares_total = track!(CounterBuilder::new("rolled_back_shares_total")
            .namespace("nimbusio")
            .subsystem("dispatcher")
            .help("Number of finalized shares aborted by rollback")
            .default_registry()
            .finish())?;
        Ok(DispatcherMetrics {
            writes_total,
            failures_total,
            lost_shares_total,
            handoffs_total,
            rolled_back_shares_total,
        })
    }
}
