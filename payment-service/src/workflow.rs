use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use shared::RpcClient;
use crate::models::{Payment, PaymentStatus};
use crate::store::PaymentStore;

/// The simulated payment gateway.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub name: String,
    /// How long the gateway takes to answer.
    pub delay: Duration,
    /// Share of payments the gateway declines, from 0.0 to 1.0.
    pub decline_rate: f64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            name: "simulated-gateway".to_string(),
            delay: Duration::from_secs(10),
            decline_rate: 0.0,
        }
    }
}

impl GatewaySettings {
    fn declines(&self) -> bool {
        self.decline_rate > 0.0 && rand::random::<f64>() < self.decline_rate
    }
}

/// Drives accepted payments to `completed` or `failed` in the background.
///
/// Every run is tracked so `shutdown` can wait for it.
pub struct PaymentWorkflow {
    store: Arc<dyn PaymentStore>,
    inventory: Arc<RpcClient>,
    gateway: GatewaySettings,
    tasks: Mutex<JoinSet<()>>,
}

impl PaymentWorkflow {
    pub fn new(store: Arc<dyn PaymentStore>, inventory: Arc<RpcClient>, gateway: GatewaySettings) -> Self {
        Self {
            store,
            inventory,
            gateway,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(finished) = tasks.try_join_next() {
            if let Err(e) = finished {
                error!("Payment workflow task failed: {}", e);
            }
        }
        tasks
    }

    /// Starts processing `payment`, which must already be stored as pending.
    pub fn start(&self, payment: Payment) {
        let store = self.store.clone();
        let inventory = self.inventory.clone();
        let gateway = self.gateway.clone();

        self.tasks().spawn(async move {
            settle(store.as_ref(), &inventory, &gateway, payment).await;
        });
    }

    /// Number of payments still being processed.
    pub fn in_flight(&self) -> usize {
        self.tasks().len()
    }

    /// Waits up to `grace` for running workflows, then aborts the rest.
    /// Aborted payments stay `pending`.
    pub async fn shutdown(&self, grace: Duration) {
        let mut tasks = std::mem::take(&mut *self.tasks());
        if tasks.is_empty() {
            return;
        }
        info!("Waiting for {} payment workflows", tasks.len());

        let drained = tokio::time::timeout(grace, async {
            while let Some(finished) = tasks.join_next().await {
                if let Err(e) = finished {
                    error!("Payment workflow task failed: {}", e);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!("Aborting {} payment workflows still running", tasks.len());
            tasks.shutdown().await;
        }
    }
}

async fn settle(
    store: &dyn PaymentStore,
    inventory: &RpcClient,
    gateway: &GatewaySettings,
    payment: Payment,
) -> PaymentStatus {
    if let Err(e) = store.set_gateway(payment.id, &gateway.name).await {
        error!("Could not record gateway for payment {}: {}", payment.id, e);
    }

    tokio::time::sleep(gateway.delay).await;

    let status = if gateway.declines() {
        warn!("Gateway {} declined payment {}", gateway.name, payment.id);
        PaymentStatus::Failed
    } else {
        info!("Gateway {} accepted payment {}", gateway.name, payment.id);
        match inventory.subtract(&payment.product_id, payment.quantity).await {
            Ok(remaining) => {
                info!("Inventory for {} updated, {} left", payment.product_id, remaining);
                PaymentStatus::Completed
            }
            Err(e) => {
                error!("Updating inventory for payment {} failed: {}", payment.id, e);
                PaymentStatus::Failed
            }
        }
    };

    if let Err(e) = store.set_status(payment.id, status).await {
        error!("Could not mark payment {} as {}: {}", payment.id, status, e);
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryPaymentStore;
    use crate::testing::{inventory, unanswered_inventory};

    fn gateway(delay: Duration) -> GatewaySettings {
        GatewaySettings { delay, ..GatewaySettings::default() }
    }

    async fn accepted(store: &MemoryPaymentStore, product_id: &str, quantity: i32) -> Payment {
        let payment = Payment::pending(product_id, quantity, 2.5).unwrap();
        store.save(&payment).await.unwrap();
        payment
    }

    async fn status_of(store: &MemoryPaymentStore, payment: &Payment) -> PaymentStatus {
        store.get(payment.id).await.unwrap().status().unwrap()
    }

    #[tokio::test]
    async fn successful_subtract_completes_payment() {
        let (stock, client) = inventory(&[("P1", 10, 2.5)]).await;
        let store = Arc::new(MemoryPaymentStore::default());
        let workflow = PaymentWorkflow::new(store.clone(), client, gateway(Duration::ZERO));

        let payment = accepted(&store, "P1", 3).await;
        workflow.start(payment.clone());
        workflow.shutdown(Duration::from_secs(5)).await;

        assert_eq!(status_of(&store, &payment).await, PaymentStatus::Completed);
        assert_eq!(
            store.get(payment.id).await.unwrap().gateway_name.as_deref(),
            Some("simulated-gateway")
        );
        assert_eq!(stock.count("P1"), 7);
    }

    #[tokio::test]
    async fn missing_product_fails_payment() {
        let (_, client) = inventory(&[]).await;
        let store = Arc::new(MemoryPaymentStore::default());
        let workflow = PaymentWorkflow::new(store.clone(), client, gateway(Duration::ZERO));

        let payment = accepted(&store, "GHOST", 1).await;
        workflow.start(payment.clone());
        workflow.shutdown(Duration::from_secs(5)).await;

        assert_eq!(status_of(&store, &payment).await, PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn unanswered_subtract_fails_payment() {
        let client = unanswered_inventory(Duration::from_millis(50));
        let store = Arc::new(MemoryPaymentStore::default());
        let workflow = PaymentWorkflow::new(store.clone(), client, gateway(Duration::ZERO));

        let payment = accepted(&store, "P1", 1).await;
        workflow.start(payment.clone());
        workflow.shutdown(Duration::from_secs(5)).await;

        assert_eq!(status_of(&store, &payment).await, PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn declined_payment_leaves_stock_alone() {
        let (stock, client) = inventory(&[("P1", 10, 2.5)]).await;
        let store = Arc::new(MemoryPaymentStore::default());
        let settings = GatewaySettings { decline_rate: 1.0, ..gateway(Duration::ZERO) };
        let workflow = PaymentWorkflow::new(store.clone(), client, settings);

        let payment = accepted(&store, "P1", 3).await;
        workflow.start(payment.clone());
        workflow.shutdown(Duration::from_secs(5)).await;

        assert_eq!(status_of(&store, &payment).await, PaymentStatus::Failed);
        assert_eq!(stock.count("P1"), 10);
    }

    #[tokio::test]
    async fn payment_stays_pending_during_gateway_delay() {
        let (_, client) = inventory(&[("P1", 10, 2.5)]).await;
        let store = Arc::new(MemoryPaymentStore::default());
        let workflow = PaymentWorkflow::new(store.clone(), client, gateway(Duration::from_secs(30)));

        let payment = accepted(&store, "P1", 3).await;
        workflow.start(payment.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(workflow.in_flight(), 1);
        assert_eq!(status_of(&store, &payment).await, PaymentStatus::Pending);

        workflow.shutdown(Duration::from_millis(20)).await;
        assert_eq!(workflow.in_flight(), 0);
        assert_eq!(status_of(&store, &payment).await, PaymentStatus::Pending);
    }
}
