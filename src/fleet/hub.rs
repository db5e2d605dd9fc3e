use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::models::DeviceRecord;
use super::plugins::browser::BrowserPlugin;
use super::plugins::device::DevicePlugin;
use super::plugins::{PluginHandle, plugin_channel};
use super::scheduler::ExecutionPlanScheduler;
use super::store::FleetStore;
use crate::hub_config::HubToml;

/// Credentials and defaults the realtime side needs.
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub device_token: Option<String>,
    pub client_token: Option<String>,
    pub page_size: i64,
}

impl HubSettings {
    pub fn from_config(config: &HubToml) -> Self {
        Self {
            device_token: config.device_token(),
            client_token: config.client_token(),
            page_size: config.page_size(),
        }
    }
}

/// The running realtime subsystem: both namespace plugins, the scheduler,
/// and the background tasks that connect them to storage.
pub struct FleetHub {
    pub devices: PluginHandle,
    pub clients: PluginHandle,
    pub scheduler: Arc<ExecutionPlanScheduler>,
    pub store: Arc<dyn FleetStore>,
    plugin_tasks: Vec<JoinHandle<()>>,
    worker_tasks: Vec<JoinHandle<()>>,
}

impl FleetHub {
    /// Compose the plugins with each other and spawn every task.
    /// Must be called from within a tokio runtime.
    pub fn start(store: Arc<dyn FleetStore>, settings: HubSettings) -> Self {
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (record_tx, record_rx) = mpsc::unbounded_channel();

        let (mut device_host, devices) = plugin_channel(
            DevicePlugin::new(settings.device_token)
                .with_ack_sink(ack_tx)
                .with_record_sink(record_tx),
        );
        let (mut client_host, clients) = plugin_channel(BrowserPlugin::new(
            settings.client_token,
            settings.page_size,
        ));

        let plugins = [devices.clone(), clients.clone()];
        device_host.connect(&plugins);
        client_host.connect(&plugins);

        let scheduler = Arc::new(ExecutionPlanScheduler::new(store.clone(), devices.clone()));
        let worker_tasks = vec![
            scheduler.clone().spawn_ack_listener(ack_rx),
            spawn_record_writer(store.clone(), record_rx),
        ];
        let plugin_tasks = vec![device_host.spawn(), client_host.spawn()];
        info!(page_size = settings.page_size, "fleet hub started");

        Self {
            devices,
            clients,
            scheduler,
            store,
            plugin_tasks,
            worker_tasks,
        }
    }

    /// Stop both plugins, closing every connection, then let the storage
    /// workers drain what the plugins already queued.
    pub async fn shutdown(self) {
        self.devices.shutdown();
        self.clients.shutdown();
        for task in self.plugin_tasks {
            if let Err(e) = task.await {
                warn!("plugin task ended abnormally: {}", e);
            }
        }
        // Worker channels close once the device plugin is dropped.
        for task in self.worker_tasks {
            if let Err(e) = task.await {
                warn!("worker task ended abnormally: {}", e);
            }
        }
        info!("fleet hub stopped");
    }
}

/// Persist device records off the plugin path.
fn spawn_record_writer(
    store: Arc<dyn FleetStore>,
    mut records: mpsc::UnboundedReceiver<DeviceRecord>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(record) = records.recv().await {
            let device_id = record.device_id.clone();
            if let Err(e) = store.upsert_device(record).await {
                warn!(device_id = %device_id, "failed to persist device record: {:#}", e);
            }
        }
        debug!("device record writer stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::fleet::db::{DbHandle, FleetDb};
    use crate::fleet::plugins::{Connection, Delivery, Handshake};
    use fleet_common::{Frame, events};
    use serde_json::json;

    fn settings() -> HubSettings {
        HubSettings {
            device_token: Some("dev".to_string()),
            client_token: Some("ops".to_string()),
            page_size: 10,
        }
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !check().await {
            assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_settings_from_config() {
        let config = HubToml::parse(
            r#"
[auth]
device_token = "d"
client_token = "c"

[pagination]
page_size = 5
"#,
        )
        .unwrap();
        let settings = HubSettings::from_config(&config);
        assert_eq!(settings.page_size, 5);
    }

    #[tokio::test]
    async fn test_state_report_reaches_observer_and_storage() {
        let db = DbHandle::new(FleetDb::new_in_memory().unwrap());
        let hub = FleetHub::start(Arc::new(db.clone()), settings());

        let (observer, mut observer_mailbox) = Connection::new();
        hub.clients
            .connect(
                observer,
                Handshake {
                    token: Some("ops".to_string()),
                    device_id: None,
                },
            )
            .unwrap();
        let first = match observer_mailbox.recv().await {
            Delivery::Frame(frame) => frame,
            Delivery::Close => panic!("observer closed"),
        };
        assert_eq!(first.event, events::REALTIME_INFO);

        let (device, _device_mailbox) = Connection::new();
        let device_id = device.id().clone();
        hub.devices
            .connect(
                device,
                Handshake {
                    token: Some("dev".to_string()),
                    device_id: Some("d1".to_string()),
                },
            )
            .unwrap();
        hub.devices
            .message(device_id, Frame::new(events::REPORT_STATE, json!({"cpu": 3})))
            .unwrap();

        let mut saw_state = false;
        while !saw_state {
            let Delivery::Frame(frame) = observer_mailbox.recv().await else {
                panic!("observer closed");
            };
            saw_state = frame.data["items"][0]["data"] == json!({"cpu": 3});
        }

        let store = hub.store.clone();
        wait_for(|| {
            let store = store.clone();
            async move { store.device_summaries().await.unwrap().len() == 1 }
        })
        .await;

        hub.shutdown().await;
        assert_eq!(observer_mailbox.recv().await, Delivery::Close);
    }
}
