//! Background loading of the pages a progressive open left unloaded.
//!
//! Pages are loaded in units: a unit loads pages until its time box runs out
//! (or its optional page cap is reached, always at least one page), then the
//! progress callback runs. Returning `false` from the callback is the only way
//! to stop a sweep besides disposing the document.

use super::cancel::CancellationToken;
use super::document::Document;
use super::page::PageLoadStatus;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::ops::RangeInclusive;
use std::time::{Duration, Instant};
use tracing::debug;

/// Progress callback of a sweep: `(settled pages, total pages) -> continue?`
pub type ProgressFn = Box<dyn FnMut(u32, u32) -> bool + Send>;

type Sweep = Shared<BoxFuture<'static, bool>>;

/// Drives the progressive loading of one document.
///
/// At most one sweep runs at a time. A second call while a sweep is running
/// attaches to it: it waits for the running sweep and reports the final
/// progress once through its own callback.
pub struct ProgressiveLoadController {
    unit_duration: Duration,
    max_pages_per_unit: Option<usize>,
    sweep: Mutex<Option<Sweep>>,
    /// Page numbers to load before the linear sweep
    priority: Mutex<Option<RangeInclusive<u32>>>,
    cancel: CancellationToken,
}

impl ProgressiveLoadController {
    pub fn new(unit_duration: Duration, max_pages_per_unit: Option<usize>) -> Self {
        Self {
            unit_duration,
            max_pages_per_unit: max_pages_per_unit.map(|n| n.max(1)),
            sweep: Mutex::new(None),
            priority: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Sets (or clears) the page-number range the next units load first.
    pub fn set_priority(&self, pages: Option<RangeInclusive<u32>>) {
        *self.priority.lock() = pages;
    }

    pub fn priority(&self) -> Option<RangeInclusive<u32>> {
        self.priority.lock().clone()
    }

    /// True while a sweep is running.
    pub fn is_running(&self) -> bool {
        self.sweep.lock().is_some()
    }

    /// Stops every sweep after the page currently loading.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) async fn load(&self, doc: Document, mut on_progress: ProgressFn) -> bool {
        let (sweep, attached) = {
            let mut slot = self.sweep.lock();
            match slot.as_ref() {
                Some(running) => (running.clone(), true),
                None => {
                    let task = tokio::spawn(run_sweep(
                        doc.clone(),
                        on_progress_holder(&mut on_progress),
                        self.unit_duration,
                        self.max_pages_per_unit,
                    ));
                    let shared = async move { task.await.unwrap_or(false) }.boxed().shared();
                    *slot = Some(shared.clone());
                    (shared, false)
                }
            }
        };

        let completed = sweep.await;
        if attached {
            let (settled, total) = doc.settled_count();
            on_progress(settled, total);
        }
        completed
    }

    fn finish(&self) {
        *self.sweep.lock() = None;
    }
}

/// Moves the caller's callback into the sweep task, leaving a no-op behind.
fn on_progress_holder(on_progress: &mut ProgressFn) -> ProgressFn {
    std::mem::replace(on_progress, Box::new(|_, _| true))
}

async fn run_sweep(
    doc: Document,
    mut on_progress: ProgressFn,
    unit_duration: Duration,
    max_pages_per_unit: Option<usize>,
) -> bool {
    let controller = doc.progressive();
    let completed = loop {
        if controller.cancel.is_cancelled() || doc.is_disposed() {
            break false;
        }

        let deadline = Instant::now() + unit_duration;
        let mut in_unit = 0usize;
        while let Some((pos, page)) = doc.next_pending(controller.priority().as_ref()) {
            let mut loaded = page.ensure_loaded().await;
            if !loaded.status().is_terminal() {
                // The page's source document is gone; it can never load
                loaded = page.with_state(page.native_geometry(), PageLoadStatus::Failed);
            }
            doc.refresh_position(pos, &page, loaded);
            in_unit += 1;
            if controller.cancel.is_cancelled()
                || Instant::now() >= deadline
                || max_pages_per_unit.is_some_and(|max| in_unit >= max)
            {
                break;
            }
        }

        if controller.cancel.is_cancelled() || doc.is_disposed() {
            break false;
        }
        let (settled, total) = doc.settled_count();
        if in_unit == 0 {
            break settled == total;
        }
        debug!(document = %doc.id(), settled, total, in_unit, "progressive unit done");
        if !on_progress(settled, total) {
            debug!(document = %doc.id(), "progressive loading cancelled");
            break false;
        }
        if settled == total {
            break true;
        }
    };
    controller.finish();
    completed
}
