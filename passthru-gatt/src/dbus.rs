//! BlueZ D-Bus objects backed by an [`AttributeTree`]
//!
//! Interfaces:
//! - `org.bluez.GattService1`
//! - `org.bluez.GattCharacteristic1`
//! - `org.bluez.GattDescriptor1`

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};
use zbus::interface;
use zbus::zvariant::{OwnedFd, OwnedObjectPath, OwnedValue};

use crate::error::GattError;
use crate::options::AttributeOptions;
use crate::tree::{AttributeRef, AttributeTree, CharacteristicId, DescriptorId, ServiceId};

/// Tree shared between the object server and the relay loop.
///
/// Never hold the lock across an `.await`.
pub type SharedTree = Arc<Mutex<AttributeTree>>;

/// Errors returned to BlueZ
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.bluez.Error")]
pub enum BluezError {
    #[zbus(error)]
    ZBus(zbus::Error),
    NotSupported(String),
    InvalidOffset(String),
    InvalidArguments(String),
    Failed(String),
}

impl From<GattError> for BluezError {
    fn from(err: GattError) -> Self {
        let msg = err.to_string();
        match err {
            GattError::NotSupported { .. } => BluezError::NotSupported(msg),
            GattError::InvalidOffset { .. } => BluezError::InvalidOffset(msg),
            GattError::InvalidArguments(_) => BluezError::InvalidArguments(msg),
            GattError::Bus(e) => BluezError::ZBus(e),
            _ => BluezError::Failed(msg),
        }
    }
}

fn object_path(path: &str) -> Result<OwnedObjectPath, GattError> {
    OwnedObjectPath::try_from(path).map_err(|_| GattError::InvalidPath(path.to_string()))
}

// === Service ===

pub struct ServiceObject {
    tree: SharedTree,
    id: ServiceId,
}

#[interface(name = "org.bluez.GattService1")]
impl ServiceObject {
    #[zbus(property, name = "UUID")]
    fn uuid(&self) -> String {
        self.tree.lock().service(self.id).uuid().to_string()
    }

    #[zbus(property)]
    fn primary(&self) -> bool {
        self.tree.lock().service(self.id).primary()
    }
}

// === Characteristic ===

pub struct CharacteristicObject {
    tree: SharedTree,
    id: CharacteristicId,
    service_path: OwnedObjectPath,
}

#[interface(name = "org.bluez.GattCharacteristic1")]
impl CharacteristicObject {
    async fn read_value(
        &self,
        options: HashMap<String, OwnedValue>,
    ) -> Result<Vec<u8>, BluezError> {
        let opts = AttributeOptions::from_dict(&options)?;
        Ok(self.tree.lock().read_characteristic(self.id, &opts)?)
    }

    async fn write_value(
        &self,
        value: Vec<u8>,
        options: HashMap<String, OwnedValue>,
    ) -> Result<(), BluezError> {
        let opts = AttributeOptions::from_dict(&options)?;
        let result = self.tree.lock().write_characteristic(self.id, &value, &opts);
        match &result {
            Err(e) if e.is_protocol() => debug!("WriteValue rejected: {e}"),
            Err(e) => warn!("WriteValue failed: {e}"),
            Ok(()) => {}
        }
        Ok(result?)
    }

    #[zbus(out_args("fd", "mtu"))]
    async fn acquire_notify(
        &self,
        options: HashMap<String, OwnedValue>,
    ) -> Result<(OwnedFd, u16), BluezError> {
        let opts = AttributeOptions::from_dict(&options)?;
        let (fd, mtu) = self.tree.lock().acquire_notify(self.id, &opts)?;
        Ok((OwnedFd::from(fd), mtu))
    }

    async fn start_notify(&self) -> Result<(), BluezError> {
        Err(BluezError::NotSupported("Use AcquireNotify".to_string()))
    }

    async fn stop_notify(&self) -> Result<(), BluezError> {
        Err(BluezError::NotSupported("Use AcquireNotify".to_string()))
    }

    #[zbus(property, name = "UUID")]
    fn uuid(&self) -> String {
        self.tree.lock().characteristic(self.id).uuid().to_string()
    }

    #[zbus(property)]
    fn service(&self) -> OwnedObjectPath {
        self.service_path.clone()
    }

    #[zbus(property)]
    fn flags(&self) -> Vec<String> {
        self.tree.lock().characteristic(self.id).flags().to_bluez()
    }

    #[zbus(property)]
    fn notify_acquired(&self) -> bool {
        self.tree.lock().characteristic(self.id).notify_acquired()
    }

    #[zbus(property, name = "MTU")]
    fn mtu(&self) -> u16 {
        self.tree.lock().characteristic(self.id).mtu()
    }
}

// === Descriptor ===

pub struct DescriptorObject {
    tree: SharedTree,
    id: DescriptorId,
    characteristic_path: OwnedObjectPath,
}

#[interface(name = "org.bluez.GattDescriptor1")]
impl DescriptorObject {
    async fn read_value(
        &self,
        options: HashMap<String, OwnedValue>,
    ) -> Result<Vec<u8>, BluezError> {
        let opts = AttributeOptions::from_dict(&options)?;
        Ok(self.tree.lock().read_descriptor(self.id, &opts)?)
    }

    async fn write_value(
        &self,
        _value: Vec<u8>,
        _options: HashMap<String, OwnedValue>,
    ) -> Result<(), BluezError> {
        Err(BluezError::NotSupported("Descriptor is read-only".to_string()))
    }

    #[zbus(property, name = "UUID")]
    fn uuid(&self) -> String {
        self.tree.lock().descriptor(self.id).uuid().to_string()
    }

    #[zbus(property)]
    fn characteristic(&self) -> OwnedObjectPath {
        self.characteristic_path.clone()
    }

    #[zbus(property)]
    fn flags(&self) -> Vec<String> {
        self.tree.lock().descriptor(self.id).flags().to_bluez()
    }
}

// === Publication ===

/// Export a service, its characteristics and their descriptors in order
pub async fn publish_service(
    conn: &zbus::Connection,
    tree: &SharedTree,
    id: ServiceId,
) -> Result<(), GattError> {
    let plan = tree.lock().registration_plan(id);
    let server = conn.object_server();

    for (path, node) in plan {
        let added = match node {
            AttributeRef::Service(id) => {
                let obj = ServiceObject {
                    tree: Arc::clone(tree),
                    id,
                };
                server.at(path.as_str(), obj).await?
            }
            AttributeRef::Characteristic(id) => {
                let service = tree.lock().characteristic(id).service();
                let service_path = object_path(&tree.lock().service_path(service))?;
                let obj = CharacteristicObject {
                    tree: Arc::clone(tree),
                    id,
                    service_path,
                };
                server.at(path.as_str(), obj).await?
            }
            AttributeRef::Descriptor(id) => {
                let parent = tree.lock().descriptor(id).characteristic();
                let characteristic_path = object_path(&tree.lock().characteristic_path(parent))?;
                let obj = DescriptorObject {
                    tree: Arc::clone(tree),
                    id,
                    characteristic_path,
                };
                server.at(path.as_str(), obj).await?
            }
        };

        if added {
            debug!("Published {path}");
        } else {
            warn!("{path} was already published");
        }
    }

    Ok(())
}

/// Export every service of the tree
pub async fn publish_tree(conn: &zbus::Connection, tree: &SharedTree) -> Result<(), GattError> {
    let services: Vec<ServiceId> = tree.lock().service_ids().collect();
    for id in services {
        publish_service(conn, tree, id).await?;
    }
    Ok(())
}

/// Remove a published service subtree, leaves first
pub async fn unpublish_service(
    conn: &zbus::Connection,
    tree: &SharedTree,
    id: ServiceId,
) -> Result<(), GattError> {
    let plan = tree.lock().registration_plan(id);
    let server = conn.object_server();

    for (path, node) in plan.into_iter().rev() {
        let result = match node {
            AttributeRef::Service(_) => server.remove::<ServiceObject, _>(path.as_str()).await,
            AttributeRef::Characteristic(_) => {
                server
                    .remove::<CharacteristicObject, _>(path.as_str())
                    .await
            }
            AttributeRef::Descriptor(_) => {
                server.remove::<DescriptorObject, _>(path.as_str()).await
            }
        };
        match result {
            Ok(_) => debug!("Removed {path}"),
            Err(zbus::Error::InterfaceNotFound) => debug!("{path} was not published"),
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}
