//! Host events into guest input and redraws

use std::rc::{Rc, Weak};

use tracing::{debug, trace};

use crate::error::Result;
use crate::host::{HostConnection, HostEvent};
use crate::session::Session;

/// Entry points of the guest input device. Fire and forget.
pub trait InputSink {
    fn post_motion(&self, x: i32, y: i32);
    fn post_button(&self, button: u8, is_down: bool);
    fn post_key(&self, keycode: u8, is_down: bool);
}

/// Non-owning link to the guest input device, absent until it registers.
#[derive(Default)]
pub struct InputRoute {
    device: Option<Weak<dyn InputSink>>,
}

impl std::fmt::Debug for InputRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputRoute")
            .field("connected", &self.device().is_some())
            .finish()
    }
}

impl InputRoute {
    pub fn set<S: InputSink + 'static>(&mut self, device: &Rc<S>) {
        let device: Weak<S> = Rc::downgrade(device);
        self.device = Some(device as Weak<dyn InputSink>);
    }

    pub fn clear(&mut self) {
        self.device = None;
    }

    /// The device, if registered and still alive.
    pub fn device(&self) -> Option<Rc<dyn InputSink>> {
        self.device.as_ref().and_then(Weak::upgrade)
    }

    /// Forwards an input event; returns whether a device received it.
    /// Non-input events are ignored.
    pub fn deliver(&self, event: HostEvent) -> bool {
        match event {
            HostEvent::Motion { x, y } => {
                self.post(event, |device| device.post_motion(x.into(), y.into()))
            }
            HostEvent::Key { keycode, pressed } => {
                self.post(event, |device| device.post_key(keycode, pressed))
            }
            HostEvent::Button { button, pressed } => {
                self.post(event, |device| device.post_button(button, pressed))
            }
            _ => {
                trace!(?event, "ignoring host event");
                false
            }
        }
    }

    fn post(&self, event: HostEvent, post: impl FnOnce(&dyn InputSink)) -> bool {
        match self.device() {
            Some(device) => {
                post(device.as_ref());
                true
            }
            None => {
                debug!(?event, "Input device is not yet initialized, ignoring input");
                false
            }
        }
    }
}

impl<H: HostConnection> Session<H> {
    /// Processes every event the host has queued and returns how many there
    /// were. Never waits for more; call it whenever
    /// [`Session::descriptor`] becomes readable.
    pub fn check_events(&mut self) -> Result<usize> {
        let mut drained = 0;

        while let Some(event) = self.host.poll_for_event()? {
            drained += 1;
            match event {
                HostEvent::Expose {
                    x,
                    y,
                    width,
                    height,
                } => {
                    let (x, y) = (i32::from(x), i32::from(y));
                    self.update_region(x, y, x + i32::from(width), y + i32::from(height))?;
                }
                event => {
                    self.route.deliver(event);
                }
            }
        }

        Ok(drained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingSink;

    #[test]
    fn events_without_a_device_are_dropped() {
        let route = InputRoute::default();
        assert!(!route.deliver(HostEvent::Motion { x: 1, y: 2 }));
        assert!(!route.deliver(HostEvent::Key {
            keycode: 38,
            pressed: true
        }));
    }

    #[test]
    fn input_reaches_the_registered_device() {
        let sink = Rc::new(RecordingSink::default());
        let mut route = InputRoute::default();
        route.set(&sink);

        assert!(route.deliver(HostEvent::Motion { x: -3, y: 40 }));
        assert!(route.deliver(HostEvent::Button {
            button: 3,
            pressed: false
        }));
        assert!(route.deliver(HostEvent::Key {
            keycode: 24,
            pressed: true
        }));
        assert!(!route.deliver(HostEvent::Crossing { entered: true }));
        assert!(!route.deliver(HostEvent::Other));

        assert_eq!(sink.motions(), vec![(-3, 40)]);
        assert_eq!(sink.buttons(), vec![(3, false)]);
        assert_eq!(sink.keys(), vec![(24, true)]);
    }

    #[test]
    fn route_does_not_keep_the_device_alive() {
        let sink = Rc::new(RecordingSink::default());
        let mut route = InputRoute::default();
        route.set(&sink);
        drop(sink);

        assert!(route.device().is_none());
        assert!(!route.deliver(HostEvent::Motion { x: 0, y: 0 }));
    }

    #[test]
    fn clearing_the_route_stops_delivery() {
        let sink = Rc::new(RecordingSink::default());
        let mut route = InputRoute::default();
        route.set(&sink);
        route.clear();

        assert!(!route.deliver(HostEvent::Key {
            keycode: 9,
            pressed: true
        }));
        assert!(sink.keys().is_empty());
    }
}
