//! Driver callbacks
//!
//! A device driver implements [`DeviceLifecycle`] for one device type and
//! one role. The bus calls it at the transitions of the connection state
//! machine, always from a single thread at a time per device and with no
//! bus or device lock held, so callbacks may use every method of the
//! device handle.
//!
//! | callback       | frontend                         | backend                               |
//! |----------------|----------------------------------|---------------------------------------|
//! | `probe`        | ring granted, before Initialised | device created, before InitWait       |
//! | `reconfigured` | ring re-granted after migration  | peer ring mapped, channel bound       |
//! | `connected`    | entering Connected               | entering Connected                    |
//! | `suspend`      | data path drained                | data path drained, before Suspending  |
//! | `resume`       | before Connected                 | before Resuming                       |
//! | `closed`       | ring released                    | ring released                         |
//! | `shutdown`     | before Closing                   | before Closing                        |
//!
//! An error from `probe`, `reconfigured` or `connected` aborts the
//! transition and leaves the device in its previous state.

use crate::device::VbusDevice;
use crate::error::VbusError;

pub trait DeviceLifecycle: Send + Sync {
    fn probe(&self, _dev: &VbusDevice) -> Result<(), VbusError> {
        Ok(())
    }

    fn reconfigured(&self, _dev: &VbusDevice) -> Result<(), VbusError> {
        Ok(())
    }

    fn connected(&self, _dev: &VbusDevice) -> Result<(), VbusError> {
        Ok(())
    }

    fn suspend(&self, _dev: &VbusDevice) -> Result<(), VbusError> {
        Ok(())
    }

    fn resume(&self, _dev: &VbusDevice) -> Result<(), VbusError> {
        Ok(())
    }

    fn closed(&self, _dev: &VbusDevice) {}

    fn shutdown(&self, _dev: &VbusDevice) {}
}
