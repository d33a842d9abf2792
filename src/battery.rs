//! Battery level relay from UPower
//!
//! Reads `Percentage` from `/org/freedesktop/UPower/devices/<battery>` once,
//! then follows its `PropertiesChanged` signals.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, info};
use zbus::zvariant::{OwnedValue, Value};

use crate::error::Result;
use crate::hogp::HogpDevice;

pub const UPOWER_BUS: &str = "org.freedesktop.UPower";
pub const UPOWER_DEVICE: &str = "org.freedesktop.UPower.Device";
const PROPERTIES: &str = "org.freedesktop.DBus.Properties";

pub fn battery_path(battery: &str) -> String {
    format!("/org/freedesktop/UPower/devices/{battery}")
}

fn as_f64(value: &Value<'_>) -> Option<f64> {
    match value {
        Value::Value(inner) => as_f64(inner),
        Value::F64(v) => Some(*v),
        _ => None,
    }
}

/// `Percentage` out of a `PropertiesChanged` body, if it carries one
pub fn changed_percentage(interface: &str, changed: &HashMap<String, OwnedValue>) -> Option<f64> {
    if interface != UPOWER_DEVICE {
        return None;
    }
    changed
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("Percentage"))
        .and_then(|(_, value)| as_f64(value))
}

/// Mirror the battery's charge into the battery service until the signal
/// stream ends
pub async fn run(conn: zbus::Connection, battery: String, device: Arc<HogpDevice>) -> Result<()> {
    let path = battery_path(&battery);

    let upower =
        zbus::Proxy::new_owned(conn.clone(), UPOWER_BUS, path.clone(), UPOWER_DEVICE).await?;
    match upower.get_property::<f64>("Percentage").await {
        Ok(percentage) => device.set_battery_level(percentage),
        Err(e) => debug!("No initial battery level from {path}: {e}"),
    }

    let properties = zbus::Proxy::new_owned(conn, UPOWER_BUS, path.clone(), PROPERTIES).await?;
    let mut changes = properties.receive_signal("PropertiesChanged").await?;
    info!("Relaying battery level of {battery}");

    while let Some(msg) = changes.next().await {
        let body = msg.body();
        let Ok((interface, changed, _invalidated)) =
            body.deserialize::<(String, HashMap<String, OwnedValue>, Vec<String>)>()
        else {
            continue;
        };
        if let Some(percentage) = changed_percentage(&interface, &changed) {
            device.set_battery_level(percentage);
        }
    }

    debug!("Battery signal stream for {path} ended");
    Ok(())
}
