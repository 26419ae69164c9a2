//! btleplug adapter behind the core [`Radio`] trait

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Manager as _, Peripheral as _, PeripheralProperties,
    ScanFilter,
};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use futures::stream::StreamExt;
use lightblue_core::radio::{Advertisement, Radio, RadioEvent, RadioEventStream, RadioState};
use lightblue_core::{Peripheral, Result};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::BleError;
use crate::peripheral::BlePeripheral;

// ----------------------------------------------------------------------------
// Radio Implementation
// ----------------------------------------------------------------------------

/// One peripheral wrapper per platform id, so connect state survives
/// repeated advertisements
type PeripheralCache = Arc<Mutex<HashMap<PeripheralId, Arc<BlePeripheral>>>>;

/// Local adapter driven through btleplug
pub struct BleRadio {
    adapter: Adapter,
    peripherals: PeripheralCache,
}

impl BleRadio {
    /// Open the first adapter the platform reports
    pub async fn new() -> std::result::Result<Self, BleError> {
        let manager = Manager::new()
            .await
            .map_err(|e| BleError::ManagerFailed(e.to_string()))?;

        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(BleError::AdapterNotAvailable)?;

        info!("BLE adapter initialized");
        Ok(Self::with_adapter(adapter))
    }

    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

fn radio_state(state: CentralState) -> RadioState {
    match state {
        CentralState::PoweredOn => RadioState::PoweredOn,
        CentralState::PoweredOff => RadioState::PoweredOff,
        _ => RadioState::Unknown,
    }
}

/// Resolve an advertising peripheral into a core advertisement
async fn advertisement(
    adapter: &Adapter,
    peripherals: &PeripheralCache,
    id: PeripheralId,
) -> Option<Advertisement> {
    let platform = match adapter.peripheral(&id).await {
        Ok(peripheral) => peripheral,
        Err(e) => {
            debug!("Advertising peripheral vanished: {}", e);
            return None;
        }
    };

    let properties: PeripheralProperties = match platform.properties().await {
        Ok(Some(properties)) => properties,
        Ok(None) => return None,
        Err(e) => {
            debug!("Failed to read peripheral properties: {}", e);
            return None;
        }
    };

    let peripheral = peripherals
        .lock()
        .entry(id)
        .or_insert_with(|| Arc::new(BlePeripheral::new(platform)))
        .clone();

    Some(Advertisement {
        address: peripheral.address(),
        local_name: properties.local_name,
        service_uuids: properties.services,
        peripheral,
    })
}

#[async_trait]
impl Radio for BleRadio {
    async fn state(&self) -> RadioState {
        match self.adapter.adapter_state().await {
            Ok(state) => radio_state(state),
            Err(e) => {
                warn!("Failed to query adapter state: {}", e);
                RadioState::Unknown
            }
        }
    }

    async fn start_scan(&self) -> Result<()> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(BleError::from)?;
        info!("Started BLE scanning");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await.map_err(BleError::from)?;
        info!("Stopped BLE scanning");
        Ok(())
    }

    async fn events(&self) -> Result<RadioEventStream> {
        let events = self
            .adapter
            .events()
            .await
            .map_err(|e| BleError::EventStreamFailed(e.to_string()))?;

        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();
        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let peripherals = peripherals.clone();
            async move {
                match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ServicesAdvertisement { id, .. } => {
                        advertisement(&adapter, &peripherals, id)
                            .await
                            .map(RadioEvent::Advertisement)
                    }
                    CentralEvent::StateUpdate(state) => {
                        Some(RadioEvent::StateChanged(radio_state(state)))
                    }
                    _ => None,
                }
            }
        });

        Ok(Box::pin(stream))
    }
}
