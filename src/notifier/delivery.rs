//! The two phases of a notify run.
//!
//! [`DeliveryBatch::select`] fixes what will be delivered (ordering and
//! filtering, no I/O). [`DeliveryBatch::deliver`] sends it one listing at a
//! time. Cancellation is checked between listings; once seen, the rest of the
//! batch is drained without further checks so nothing already selected is
//! lost.

use metrics::counter;

use crate::filters::FilterSet;
use crate::model::{ListingRecord, SubscriberId};
use crate::scheduler::JobContext;
use crate::sink::DeliverySink;

/// Outcome of one notify run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub fetched: usize,
    pub filtered_out: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Listings sent after cancellation was observed.
    pub drained: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DeliveryBatch {
    listings: Vec<ListingRecord>,
    fetched: usize,
    filtered_out: usize,
}

impl DeliveryBatch {
    /// Order by update time (stable, so ties keep fetch order) and drop
    /// listings the filters reject.
    pub fn select(mut listings: Vec<ListingRecord>, filters: &FilterSet) -> Self {
        let fetched = listings.len();
        listings.sort_by_key(|l| l.updated_time);
        listings.retain(|l| filters.matches(l));
        Self {
            filtered_out: fetched - listings.len(),
            fetched,
            listings,
        }
    }

    pub fn len(&self) -> usize {
        self.listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }

    pub fn listings(&self) -> &[ListingRecord] {
        &self.listings
    }

    pub async fn deliver(
        self,
        subscriber: &SubscriberId,
        sink: &dyn DeliverySink,
        ctx: &JobContext,
    ) -> DeliveryReport {
        let mut report = DeliveryReport {
            fetched: self.fetched,
            filtered_out: self.filtered_out,
            ..DeliveryReport::default()
        };
        counter!("listings_filtered_out_total").increment(self.filtered_out as u64);

        let total = self.listings.len();
        for (i, listing) in self.listings.iter().enumerate() {
            if !report.cancelled && ctx.is_cancelled() {
                report.cancelled = true;
                tracing::debug!(
                    subscriber = %subscriber,
                    remaining = total - i,
                    "notification interrupted; delivering remaining listings before stopping"
                );
            }

            match sink.deliver(subscriber, listing).await {
                Ok(()) => {
                    report.delivered += 1;
                    counter!("listings_delivered_total").increment(1);
                }
                Err(e) => {
                    report.failed += 1;
                    counter!("delivery_errors_total", "sink" => sink.name().to_string()).increment(1);
                    tracing::warn!(
                        error = %e,
                        subscriber = %subscriber,
                        sink = sink.name(),
                        "delivery failed; continuing with next listing"
                    );
                }
            }
            if report.cancelled {
                report.drained += 1;
                counter!("delivery_drained_total").increment(1);
            }
        }
        report
    }
}
