//! The owning component's side of a processor.

use std::sync::Arc;

use eventproc_core::{DataId, EventParams};
use eventproc_events::{Attributes, EventRecord, ProcessingContext};

/// Business logic driven by a processor's worker.
///
/// Callbacks run on the worker thread, one record at a time, with the queue
/// unlocked. Errors and panics are caught and logged by the worker; the record
/// is marked done either way. A component wanting a retry emits a fresh event.
pub trait Component: Send + Sync + 'static {
    /// Called for `Create` and `Update` records.
    fn on_update(
        &self,
        ctx: &ProcessingContext,
        record: &EventRecord,
        attributes: &Attributes,
    ) -> anyhow::Result<()>;

    /// Called for `Delete` records.
    fn on_delete(
        &self,
        ctx: &ProcessingContext,
        record: &EventRecord,
        attributes: &Attributes,
    ) -> anyhow::Result<()>;

    /// Load the business attributes of a data object.
    ///
    /// Runs at most once per record, right before its callback.
    fn load_attributes(&self, _data_id: &DataId) -> anyhow::Result<Attributes> {
        Ok(Attributes::new())
    }

    /// Merge the params of two aggregated events. Must be associative.
    fn combine_params(&self, older: EventParams, newer: EventParams) -> EventParams {
        older | newer
    }

    /// Share of processing time spent waiting on external resources, 0..=100.
    ///
    /// That share is not added to the inter-cycle sleep.
    fn external_wait_percent(&self) -> u8 {
        0
    }

    /// Whether records already picked up by the worker are still persisted.
    fn persist_in_flight(&self) -> bool {
        false
    }
}

impl<C> Component for Arc<C>
where
    C: Component + ?Sized,
{
    fn on_update(
        &self,
        ctx: &ProcessingContext,
        record: &EventRecord,
        attributes: &Attributes,
    ) -> anyhow::Result<()> {
        (**self).on_update(ctx, record, attributes)
    }

    fn on_delete(
        &self,
        ctx: &ProcessingContext,
        record: &EventRecord,
        attributes: &Attributes,
    ) -> anyhow::Result<()> {
        (**self).on_delete(ctx, record, attributes)
    }

    fn load_attributes(&self, data_id: &DataId) -> anyhow::Result<Attributes> {
        (**self).load_attributes(data_id)
    }

    fn combine_params(&self, older: EventParams, newer: EventParams) -> EventParams {
        (**self).combine_params(older, newer)
    }

    fn external_wait_percent(&self) -> u8 {
        (**self).external_wait_percent()
    }

    fn persist_in_flight(&self) -> bool {
        (**self).persist_in_flight()
    }
}
