//! External resource arbitration.
//!
//! Embedded platforms gate access to the hardware codec blocks through a
//! central broker that assigns decoder/encoder slot indices. The engines
//! never talk to the broker themselves; the integrating layer acquires a
//! slot, passes the port index into `initialize`, and releases the slot
//! after `destroy`. The broker may also revoke a grant at any time, in which
//! case the integrator must call the engine's `release_resources` entry
//! point.

use crate::error::Result;
use crate::geometry::Size;
use crate::{DeviceType, VideoCodec};

/// Opaque handle identifying one granted resource reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceToken(pub String);

/// One granted reservation: the broker's token plus the hardware port the
/// engine may occupy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredResource {
    pub token: ResourceToken,
    pub port_index: i32,
}

/// Reserves and releases codec hardware slots.
///
/// Implementations typically forward to a remote arbitration daemon; tests
/// substitute an in-process fake.
pub trait ResourceBroker: Send + Sync {
    /// Reserves a slot able to handle `codec` streams of `size` at
    /// `frame_rate` on a device of `device_type`.
    fn acquire(
        &self,
        device_type: DeviceType,
        codec: VideoCodec,
        size: Size,
        frame_rate: u32,
    ) -> Result<AcquiredResource>;

    /// Returns a previously acquired slot.
    fn release(&self, resource: AcquiredResource) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::Error;

    /// Grants sequential port indices and tracks outstanding reservations.
    struct FakeBroker {
        outstanding: Mutex<Vec<i32>>,
        next_port: Mutex<i32>,
    }

    impl FakeBroker {
        fn new() -> Self {
            Self {
                outstanding: Mutex::new(Vec::new()),
                next_port: Mutex::new(0),
            }
        }
    }

    impl ResourceBroker for FakeBroker {
        fn acquire(
            &self,
            _device_type: DeviceType,
            _codec: VideoCodec,
            _size: Size,
            _frame_rate: u32,
        ) -> Result<AcquiredResource> {
            let mut next = self.next_port.lock().unwrap();
            let port_index = *next;
            *next += 1;
            self.outstanding.lock().unwrap().push(port_index);
            Ok(AcquiredResource {
                token: ResourceToken(format!("grant-{}", port_index)),
                port_index,
            })
        }

        fn release(&self, resource: AcquiredResource) -> Result<()> {
            let mut outstanding = self.outstanding.lock().unwrap();
            match outstanding.iter().position(|&p| p == resource.port_index) {
                Some(pos) => {
                    outstanding.remove(pos);
                    Ok(())
                }
                None => Err(Error::InvalidArgument("releasing an unknown reservation")),
            }
        }
    }

    #[test]
    fn acquire_release_round_trip() {
        let broker = FakeBroker::new();
        let broker: &dyn ResourceBroker = &broker;

        let grant = broker
            .acquire(
                DeviceType::Decoder,
                VideoCodec::H264,
                Size::new(1920, 1080),
                30,
            )
            .unwrap();
        assert_eq!(grant.port_index, 0);

        broker.release(grant.clone()).unwrap();
        assert!(broker.release(grant).is_err());
    }
}
