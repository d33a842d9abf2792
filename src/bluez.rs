//! BlueZ application root: object manager, GATT profile, LE advertisement,
//! and their registration with an adapter
//!
//! Registration replies arrive after the relay loop has started, so they are
//! awaited in background tasks that mark the [`ShutdownContext`] as failed
//! when BlueZ rejects the application or the advertisement.

use std::collections::HashMap;

use tracing::{debug, info, warn};
use zbus::interface;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value};

use crate::error::{PassthruError, Result};
use crate::hogp::{UUID_BATTERY, UUID_DEV_INFO, UUID_HID};
use crate::shutdown::ShutdownContext;

const BLUEZ_BUS: &str = "org.bluez";
const GATT_MANAGER: &str = "org.bluez.GattManager1";
const ADVERTISING_MANAGER: &str = "org.bluez.LEAdvertisingManager1";

fn short_uuid(uuid: u16) -> String {
    format!("{uuid:04x}")
}

/// `org.bluez.GattProfile1`: lets BlueZ auto-connect HID hosts
pub struct GattProfile {
    uuids: Vec<String>,
}

impl GattProfile {
    pub fn hid() -> Self {
        Self {
            uuids: vec![short_uuid(UUID_HID)],
        }
    }
}

#[interface(name = "org.bluez.GattProfile1")]
impl GattProfile {
    async fn release(&self) {
        debug!("GATT profile released");
    }

    #[zbus(property, name = "UUIDs")]
    fn uuids(&self) -> Vec<String> {
        self.uuids.clone()
    }
}

/// `org.bluez.LEAdvertisement1`
pub struct LeAdvertisement {
    local_name: String,
    appearance: u16,
    service_uuids: Vec<String>,
}

impl LeAdvertisement {
    pub fn new(local_name: &str, appearance: u16) -> Self {
        Self {
            local_name: local_name.to_string(),
            appearance,
            service_uuids: [UUID_DEV_INFO, UUID_HID, UUID_BATTERY]
                .into_iter()
                .map(short_uuid)
                .collect(),
        }
    }
}

#[interface(name = "org.bluez.LEAdvertisement1")]
impl LeAdvertisement {
    async fn release(&self) {
        info!("Advertisement released by BlueZ");
    }

    #[zbus(property, name = "Type")]
    fn advertisement_type(&self) -> String {
        "peripheral".to_string()
    }

    #[zbus(property, name = "ServiceUUIDs")]
    fn service_uuids(&self) -> Vec<String> {
        self.service_uuids.clone()
    }

    #[zbus(property)]
    fn local_name(&self) -> String {
        self.local_name.clone()
    }

    #[zbus(property)]
    fn appearance(&self) -> u16 {
        self.appearance
    }

    #[zbus(property)]
    fn duration(&self) -> u16 {
        0
    }

    #[zbus(property)]
    fn timeout(&self) -> u16 {
        0
    }
}

/// Object path of adapter `hciN`
pub fn adapter_path(hci: u32) -> String {
    format!("/org/bluez/hci{hci}")
}

/// First adapter exposing a GATT manager, `hci0` if none can be listed
pub async fn default_adapter(conn: &zbus::Connection) -> String {
    let listed = async {
        let proxy = zbus::Proxy::new_owned(
            conn.clone(),
            BLUEZ_BUS,
            "/",
            "org.freedesktop.DBus.ObjectManager",
        )
        .await?;
        let reply = proxy.call_method("GetManagedObjects", &()).await?;
        let objects: HashMap<OwnedObjectPath, HashMap<String, HashMap<String, OwnedValue>>> =
            reply.body().deserialize()?;
        Ok::<_, zbus::Error>(objects)
    };

    match listed.await {
        Ok(objects) => {
            let mut adapters: Vec<String> = objects
                .into_iter()
                .filter(|(_, ifaces)| ifaces.contains_key(GATT_MANAGER))
                .map(|(path, _)| path.to_string())
                .collect();
            adapters.sort();
            adapters.into_iter().next().unwrap_or_else(|| adapter_path(0))
        }
        Err(e) => {
            warn!("Could not list Bluetooth adapters: {e}");
            adapter_path(0)
        }
    }
}

/// Export the object manager, profile and advertisement at the application
/// root
pub async fn publish_root(
    conn: &zbus::Connection,
    app_path: &str,
    advertisement: LeAdvertisement,
) -> Result<()> {
    let server = conn.object_server();
    server.at(app_path, zbus::fdo::ObjectManager).await?;
    server.at(app_path, GattProfile::hid()).await?;
    server.at(app_path, advertisement).await?;
    debug!("Published application root {app_path}");
    Ok(())
}

async fn call_manager(
    conn: zbus::Connection,
    adapter: String,
    interface: &'static str,
    method: &'static str,
    app_path: String,
) -> zbus::Result<()> {
    let proxy = zbus::Proxy::new_owned(conn, BLUEZ_BUS, adapter, interface).await?;
    let path = ObjectPath::try_from(app_path.as_str())?;
    let options: HashMap<&str, Value<'_>> = HashMap::new();
    proxy.call_method(method, &(path, options)).await?;
    Ok(())
}

/// Start RegisterAdvertisement and RegisterApplication. A rejection by BlueZ
/// stops the daemon through `shutdown`.
pub fn register(
    conn: &zbus::Connection,
    adapter: &str,
    app_path: &str,
    shutdown: &ShutdownContext,
) {
    for (interface, method, what) in [
        (ADVERTISING_MANAGER, "RegisterAdvertisement", "advertisement"),
        (GATT_MANAGER, "RegisterApplication", "application"),
    ] {
        let call = call_manager(
            conn.clone(),
            adapter.to_string(),
            interface,
            method,
            app_path.to_string(),
        );
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match call.await {
                Ok(()) => info!("Registered {what}"),
                Err(e) => shutdown.fail(&format!("Failed to register {what}: {e}")),
            }
        });
    }
}

/// Best-effort UnregisterApplication and UnregisterAdvertisement
pub async fn unregister(conn: &zbus::Connection, adapter: &str, app_path: &str) {
    for (interface, method) in [
        (GATT_MANAGER, "UnregisterApplication"),
        (ADVERTISING_MANAGER, "UnregisterAdvertisement"),
    ] {
        let proxy =
            match zbus::Proxy::new_owned(conn.clone(), BLUEZ_BUS, adapter.to_string(), interface)
                .await
            {
                Ok(proxy) => proxy,
                Err(e) => {
                    warn!("{method}: {e}");
                    continue;
                }
            };
        let Ok(path) = ObjectPath::try_from(app_path) else {
            warn!("{method}: invalid path {app_path}");
            return;
        };
        if let Err(e) = proxy.call_method(method, &(path,)).await {
            warn!("{method} failed: {e}");
        }
    }
}

/// Remove the root objects published by [`publish_root`]
pub async fn unpublish_root(conn: &zbus::Connection, app_path: &str) -> Result<()> {
    let server = conn.object_server();
    for result in [
        server.remove::<LeAdvertisement, _>(app_path).await,
        server.remove::<GattProfile, _>(app_path).await,
        server.remove::<zbus::fdo::ObjectManager, _>(app_path).await,
    ] {
        match result {
            Ok(_) | Err(zbus::Error::InterfaceNotFound) => {}
            Err(e) => return Err(PassthruError::Bus(e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_path() {
        assert_eq!(adapter_path(0), "/org/bluez/hci0");
        assert_eq!(adapter_path(2), "/org/bluez/hci2");
    }

    #[test]
    fn test_advertised_services() {
        let adv = LeAdvertisement::new("USB Gamepad", 0x03C4);
        assert_eq!(adv.service_uuids, vec!["180a", "1812", "180f"]);
        assert_eq!(GattProfile::hid().uuids, vec!["1812"]);
    }
}
