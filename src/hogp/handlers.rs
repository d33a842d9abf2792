//! Write handlers of the HID service characteristics

use std::sync::Arc;

use passthru_gatt::{AttributeBuffer, GattError, WriteHandler, WriteRequest};
use tracing::{debug, trace};

use crate::hidraw::{ReportNode, FEATURE_REPORT_SIZE};

/// Reject writes that do not fit inside `value`
fn check_bounds(value: &AttributeBuffer, request: &WriteRequest<'_>) -> Result<usize, GattError> {
    let end = request
        .offset
        .checked_add(request.data.len())
        .filter(|&end| end <= value.len());
    end.ok_or(GattError::InvalidOffset {
        offset: request.offset,
        length: value.len(),
    })
}

/// HID Control Point: suspend/exit-suspend notifications, ignored
#[derive(Debug, Default)]
pub struct ControlPoint;

impl WriteHandler for ControlPoint {
    fn handle_write(
        &mut self,
        _value: &mut AttributeBuffer,
        request: &WriteRequest<'_>,
    ) -> Result<(), GattError> {
        trace!("HID control point: {:02x?}", request.data);
        Ok(())
    }
}

/// Output Report: staged locally, forwarded to the device once complete
pub struct OutputReport {
    node: Arc<dyn ReportNode>,
}

impl OutputReport {
    pub fn new(node: Arc<dyn ReportNode>) -> Self {
        Self { node }
    }
}

impl WriteHandler for OutputReport {
    fn handle_write(
        &mut self,
        value: &mut AttributeBuffer,
        request: &WriteRequest<'_>,
    ) -> Result<(), GattError> {
        let end = check_bounds(value, request)?;
        value.as_mut_slice()[request.offset..end].copy_from_slice(request.data);

        if request.is_final() {
            debug!("Output report of {end} bytes");
            self.node
                .write_report(&value.as_slice()[..end])
                .map_err(|e| GattError::Failed(format!("Output report write failed: {e}")))?;
        }
        Ok(())
    }
}

/// Feature Report: staged locally, then SET_FEATURE followed by GET_FEATURE
/// so the characteristic reflects the device's answer.
///
/// The report ID byte is not part of the characteristic value.
pub struct FeatureReport {
    node: Arc<dyn ReportNode>,
    report_id: u8,
}

impl FeatureReport {
    pub fn new(node: Arc<dyn ReportNode>, report_id: u8) -> Self {
        Self { node, report_id }
    }
}

impl WriteHandler for FeatureReport {
    fn handle_write(
        &mut self,
        value: &mut AttributeBuffer,
        request: &WriteRequest<'_>,
    ) -> Result<(), GattError> {
        let end = check_bounds(value, request)?;
        if end > FEATURE_REPORT_SIZE {
            return Err(GattError::InvalidOffset {
                offset: request.offset,
                length: FEATURE_REPORT_SIZE,
            });
        }
        value.as_mut_slice()[request.offset..end].copy_from_slice(request.data);

        if !request.is_final() {
            return Ok(());
        }

        let mut report = [0u8; FEATURE_REPORT_SIZE + 1];
        report[0] = self.report_id;
        report[1..=end].copy_from_slice(&value.as_slice()[..end]);
        debug!("Feature report out: {:02x?}", &report[..=end]);
        self.node
            .set_feature(&mut report[..=end])
            .map_err(|e| GattError::Failed(format!("SET_FEATURE failed: {e}")))?;

        let mut reply = [0u8; FEATURE_REPORT_SIZE + 1];
        reply[0] = self.report_id;
        let len = self
            .node
            .get_feature(&mut reply)
            .map_err(|e| GattError::Failed(format!("GET_FEATURE failed: {e}")))?;
        debug!("Feature report in: {:02x?}", &reply[..len.min(reply.len())]);

        let n = FEATURE_REPORT_SIZE.min(value.len());
        value.as_mut_slice()[..n].copy_from_slice(&reply[1..=n]);
        Ok(())
    }
}
