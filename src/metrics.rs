//! `/metrics` body assembly.
//!
//! Store counts and the Prusa scrape run concurrently; Bambu gauges are read from memory.
//! A section that fails or panics becomes a `# ERROR` comment and the others still render.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use printfleet_shared::{InventoryStats, PrintJobStore, PrinterRoster, PrinterType, StoreError};

use crate::bambu::BambuMetricsStore;
use crate::exposition::{labels, FamilySet};
use crate::prusa::PrusaCollector;

pub struct MetricsOrchestrator {
    roster: Arc<dyn PrinterRoster>,
    inventory: Arc<dyn InventoryStats>,
    jobs: Arc<dyn PrintJobStore>,
    prusa: Option<Arc<PrusaCollector>>,
    bambu: Option<Arc<BambuMetricsStore>>,
}

impl MetricsOrchestrator {
    pub fn new(
        roster: Arc<dyn PrinterRoster>,
        inventory: Arc<dyn InventoryStats>,
        jobs: Arc<dyn PrintJobStore>,
    ) -> Self {
        Self {
            roster,
            inventory,
            jobs,
            prusa: None,
            bambu: None,
        }
    }

    pub fn with_prusa(mut self, collector: Arc<PrusaCollector>) -> Self {
        self.prusa = Some(collector);
        self
    }

    pub fn with_bambu(mut self, store: Arc<BambuMetricsStore>) -> Self {
        self.bambu = Some(store);
        self
    }

    pub async fn render(&self) -> String {
        let (inventory, prusa) = tokio::join!(
            guarded("inventory", self.inventory_section()),
            guarded("prusa", self.prusa_section()),
        );
        let bambu = match &self.bambu {
            Some(store) => std::panic::catch_unwind(AssertUnwindSafe(|| store.render()))
                .unwrap_or_else(|_| error_line("bambu", "collector panicked")),
            None => String::new(),
        };

        let sections: Vec<String> = [inventory, prusa, bambu]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect();
        format!("{}\n", sections.join("\n\n"))
    }

    async fn inventory_section(&self) -> Result<String, StoreError> {
        let (summary, printers, jobs) = tokio::try_join!(
            self.inventory.inventory_summary(),
            self.roster.list_printers(),
            self.jobs.count_by_status(),
        )?;

        let mut set = FamilySet::new();
        set.gauge("printfleet_inventory_items", "Inventory items", vec![], summary.items_total as f64);
        set.gauge("printfleet_inventory_quantity", "Sum of item quantities", vec![], summary.quantity_total);
        set.gauge("printfleet_inventory_locations", "Storage locations", vec![], summary.locations_total as f64);
        set.gauge("printfleet_inventory_tags", "Tags", vec![], summary.tags_total as f64);
        for (location, count) in &summary.items_by_location {
            set.gauge(
                "printfleet_inventory_location_items",
                "Inventory items per location",
                labels([("location", location.as_str())]),
                *count as f64,
            );
        }
        for printer_type in [PrinterType::Prusa, PrinterType::Bambu] {
            let count = printers.iter().filter(|p| p.printer_type == printer_type).count();
            set.gauge(
                "printfleet_printers",
                "Printers in the roster by type",
                labels([("type", printer_type.to_string())]),
                count as f64,
            );
        }
        for (status, count) in jobs {
            set.gauge(
                "printfleet_print_jobs",
                "Print jobs by dispatch status",
                labels([("status", status.as_str())]),
                count as f64,
            );
        }
        Ok(set.render())
    }

    /// Empty when the Prusa collector is disabled.
    async fn prusa_section(&self) -> Result<String, StoreError> {
        let Some(collector) = &self.prusa else {
            return Ok(String::new());
        };
        let printers = self.roster.list_by_type(PrinterType::Prusa).await?;
        Ok(collector.collect(&printers).await)
    }
}

fn error_line(section: &str, message: &str) -> String {
    format!("# ERROR {}: {}", section, message.replace('\n', " "))
}

/// Run one section, turning errors and panics into an error comment.
async fn guarded<F>(section: &'static str, fut: F) -> String
where
    F: Future<Output = Result<String, StoreError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            tracing::warn!("Metrics section {} failed: {}", section, e);
            error_line(section, &e.to_string())
        }
        Err(_) => {
            tracing::error!("Metrics section {} panicked", section);
            error_line(section, "collector panicked")
        }
    }
}
