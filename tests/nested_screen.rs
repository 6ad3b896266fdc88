//! Nested screen lifecycle against the in-memory host display

use std::rc::Rc;
use std::time::Duration;

use x11nest::host::{HostEvent, PixmapFormat, VisualMasks};
use x11nest::mock::{MockDisplay, MockHost, RecordingSink, Request};
use x11nest::{BackingKind, Error, Result, ScreenConfig, Session};

fn config(width: u16, height: u16) -> ScreenConfig {
    ScreenConfig::new(width, height).expose_timeout(Some(Duration::ZERO))
}

fn open(display: &MockDisplay, config: &ScreenConfig) -> Result<Session<MockHost>> {
    Session::establish(display.connect(), &display.allocator(), config)
}

/// Deterministic pattern, different in every pixel of a small screen
fn fill(session: &mut Session<MockHost>) {
    for (i, byte) in session.framebuffer_mut().data_mut().iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
}

#[test]
fn shared_screen_800x600() {
    let display = MockDisplay::new();
    let session = open(&display, &config(800, 600).depth(24, 32)).unwrap();

    let fb = session.framebuffer();
    assert_eq!(fb.kind(), BackingKind::Shared);
    assert!(session.using_shm());
    assert_eq!((fb.width(), fb.height()), (800, 600));
    assert!(fb.stride() >= 3200);
    assert_eq!(fb.data().len(), fb.stride() * 600);
    assert_eq!(
        session.masks(),
        VisualMasks {
            red: 0xff0000,
            green: 0x00ff00,
            blue: 0x0000ff,
        }
    );
    assert_eq!(session.window().title(), "Screen 0");
}

#[test]
fn private_screen_without_shm() {
    let display = MockDisplay::builder().without_shm().build();
    let mut session = open(&display, &config(800, 600)).unwrap();

    let fb = session.framebuffer();
    assert_eq!(fb.kind(), BackingKind::Private);
    assert_eq!((fb.width(), fb.height(), fb.stride()), (800, 600, 3200));
    assert!(!session.framebuffer_mut().as_mut_ptr().is_null());
    assert_eq!(display.ledger().shm_attachments.created(), 0);
}

#[test]
fn every_shm_failure_falls_back_with_the_same_geometry() {
    let shared = open(&MockDisplay::new(), &config(120, 90)).unwrap();
    let expected = *shared.framebuffer().layout();

    let hosts = [
        MockDisplay::builder().without_shm().build(),
        MockDisplay::builder().shm_version_fails().build(),
        MockDisplay::builder().shm_attach_fails().build(),
        MockDisplay::builder().shm_allocation_fails().build(),
    ];
    for display in hosts {
        let session = open(&display, &config(120, 90)).unwrap();
        assert_eq!(session.framebuffer().kind(), BackingKind::Private);
        assert_eq!(*session.framebuffer().layout(), expected);
        assert_eq!(session.framebuffer().data().len(), expected.len());

        drop(session);
        assert!(display.ledger().is_balanced());
    }
}

#[test]
fn resources_balance_after_close() {
    let display = MockDisplay::new();
    let allocator = display.allocator();
    let session = Session::establish(display.connect(), &allocator, &config(64, 64)).unwrap();

    let ledger = display.ledger();
    assert_eq!(ledger.connections.open(), 1);
    assert_eq!(ledger.windows.open(), 1);
    assert_eq!(ledger.gcs.open(), 1);
    assert_eq!(ledger.shm_attachments.open(), 1);
    assert_eq!(allocator.allocated(), 1);

    session.close();
    assert!(ledger.is_balanced());
    assert_eq!(allocator.released(), 1);
}

#[test]
fn resources_balance_after_failed_creation() {
    let failures = [
        (MockDisplay::builder().without_xkb().build(), config(64, 64)),
        (MockDisplay::new(), config(64, 64).depth(12, 16)),
        (
            MockDisplay::builder().cursor_creation_fails().build(),
            config(64, 64),
        ),
    ];
    for (display, config) in failures {
        assert!(open(&display, &config).is_err());
        assert!(display.ledger().is_balanced());
    }
}

#[test]
fn missing_keyboard_extension_is_a_capability_error() {
    let display = MockDisplay::builder().without_xkb().build();
    assert!(matches!(
        open(&display, &config(64, 64)),
        Err(Error::Capability(_))
    ));
}

#[test]
fn input_is_dropped_until_a_device_registers() {
    let display = MockDisplay::new();
    let mut session = open(&display, &config(64, 64)).unwrap();

    display.push_event(HostEvent::Motion { x: 5, y: 6 });
    display.push_event(HostEvent::Key {
        keycode: 38,
        pressed: true,
    });
    assert_eq!(session.check_events().unwrap(), 2);

    let sink = Rc::new(RecordingSink::default());
    session.set_input_route(&sink);
    display.push_event(HostEvent::Motion { x: 7, y: 8 });
    display.push_event(HostEvent::Button {
        button: 1,
        pressed: true,
    });
    display.push_event(HostEvent::Crossing { entered: false });
    assert_eq!(session.check_events().unwrap(), 3);

    // nothing from before registration is replayed
    assert_eq!(sink.motions(), vec![(7, 8)]);
    assert_eq!(sink.buttons(), vec![(1, true)]);
    assert!(sink.keys().is_empty());

    session.clear_input_route();
    display.push_event(HostEvent::Key {
        keycode: 38,
        pressed: false,
    });
    session.check_events().unwrap();
    assert_eq!(sink.total(), 2);
}

#[test]
fn dropped_device_stops_receiving() {
    let display = MockDisplay::new();
    let mut session = open(&display, &config(64, 64)).unwrap();

    let sink = Rc::new(RecordingSink::default());
    session.set_input_route(&sink);
    drop(sink);

    display.push_event(HostEvent::Key {
        keycode: 24,
        pressed: true,
    });
    assert_eq!(session.check_events().unwrap(), 1);
    assert!(session.input_route().device().is_none());
}

#[test]
fn expose_redraws_without_reaching_the_device() {
    let display = MockDisplay::new();
    let mut session = open(&display, &config(64, 64)).unwrap();
    let sink = Rc::new(RecordingSink::default());
    session.set_input_route(&sink);
    display.clear_requests();

    display.push_event(HostEvent::Expose {
        x: 8,
        y: 4,
        width: 16,
        height: 10,
    });
    assert_eq!(session.check_events().unwrap(), 1);

    let window = session.window().id();
    let seg = session.framebuffer().shm_segment().unwrap();
    assert_eq!(
        display.requests(),
        vec![
            Request::ShmPutImage {
                window,
                rect: x11nest::host::Rect {
                    x: 8,
                    y: 4,
                    width: 16,
                    height: 10,
                },
                seg,
            },
            Request::Sync,
        ]
    );
    assert_eq!(sink.total(), 0);
}

#[test]
fn check_events_returns_zero_when_idle() {
    let display = MockDisplay::new();
    let mut session = open(&display, &config(64, 64)).unwrap();
    assert_eq!(session.check_events().unwrap(), 0);
}

#[test]
fn repeated_updates_leave_the_same_pixels() {
    for display in [MockDisplay::new(), MockDisplay::builder().without_shm().build()] {
        let mut session = open(&display, &config(40, 30)).unwrap();
        fill(&mut session);
        let window = session.window().id();

        session.update_region(0, 0, 40, 30).unwrap();
        let once = display.window_pixels(window);
        session.update_region(0, 0, 40, 30).unwrap();
        assert_eq!(display.window_pixels(window), once);

        // 32 bpp with no row padding: the window mirrors the framebuffer
        assert_eq!(once, session.framebuffer().data());
    }
}

#[test]
fn shared_and_copied_updates_agree() {
    let shared = MockDisplay::new();
    let copied = MockDisplay::builder()
        .without_shm()
        .maximum_request_bytes(1024)
        .build();

    let mut pixels = Vec::new();
    for display in [&shared, &copied] {
        let mut session = open(display, &config(40, 30)).unwrap();
        fill(&mut session);
        session.update_region(5, 3, 33, 29).unwrap();
        pixels.push(display.window_pixels(session.window().id()));
    }
    assert_eq!(pixels[0], pixels[1]);
}

#[test]
fn partial_update_only_touches_its_region() {
    let display = MockDisplay::builder().without_expose_on_map().build();
    let mut session = open(&display, &config(16, 16)).unwrap();
    let window = session.window().id();

    session.framebuffer_mut().data_mut().fill(0xff);
    session.update_region(4, 4, 8, 8).unwrap();

    let pixels = display.window_pixels(window);
    let stride = 16 * 4;
    for y in 0..16 {
        for x in 0..16 {
            let inside = (4..8).contains(&x) && (4..8).contains(&y);
            let expected = if inside { 0xff } else { 0 };
            assert_eq!(pixels[y * stride + x * 4], expected, "pixel ({x}, {y})");
        }
    }
}

#[test]
fn out_of_bounds_update_is_clipped() {
    let display = MockDisplay::new();
    let session = open(&display, &config(32, 32)).unwrap();
    display.clear_requests();

    session.update_region(-10, -10, 0, 0).unwrap();
    assert!(display.requests().is_empty());

    session.update_region(20, 20, 100, 100).unwrap();
    assert!(display.requests().iter().any(|r| matches!(
        r,
        Request::ShmPutImage { rect, .. } if rect.width == 12 && rect.height == 12
    )));
}

#[test]
fn keyboard_mappings_through_the_session() {
    let display = MockDisplay::new();
    let session = open(&display, &config(32, 32)).unwrap();
    let mappings = session.keyboard_mappings().unwrap();

    assert_eq!(mappings.keysyms.keysyms(38), Some(&[0x61, 0x41][..]));
    assert_eq!(mappings.modifiers.get(50), 0b0000_0001);
    assert_eq!(mappings.modifiers.get(37), 0b0000_0100);
}

#[test]
fn sixteen_bit_host_gets_its_own_layout_and_masks() {
    let rgb565 = VisualMasks {
        red: 0xf800,
        green: 0x07e0,
        blue: 0x001f,
    };
    let display = MockDisplay::builder()
        .visual(rgb565)
        .pixmap_formats(vec![PixmapFormat {
            depth: 16,
            bits_per_pixel: 16,
            scanline_pad: 32,
        }])
        .build();

    let session = open(&display, &config(31, 10).depth(16, 16)).unwrap();
    assert_eq!(session.masks(), rgb565);
    assert_eq!(session.framebuffer().bits_per_pixel(), 16);
    // 62 bytes of pixels padded to 32 bits
    assert_eq!(session.framebuffer().stride(), 64);

    // the host offers nothing for depth 24
    let err = open(&display, &config(31, 10)).unwrap_err();
    assert!(matches!(err, Error::Resource(_)));
    assert_eq!(display.ledger().connections.open(), 1);
}

#[test]
fn modifier_map_follows_the_host_mapping() {
    // three slots per modifier; Lock and Mod3..Mod5 unused
    let keycodes = vec![
        50, 62, 0, // Shift
        0, 0, 0, // Lock
        37, 105, 0, // Control
        64, 108, 204, // Mod1
        77, 0, 0, // Mod2
    ];
    let display = MockDisplay::builder()
        .modifier_mapping(3, keycodes)
        .build();
    let session = open(&display, &config(32, 32)).unwrap();
    let modifiers = session.keyboard_mappings().unwrap().modifiers;

    assert_eq!(modifiers.get(62), 0b0000_0001);
    assert_eq!(modifiers.get(105), 0b0000_0100);
    assert_eq!(modifiers.get(204), 0b0000_1000);
    assert_eq!(modifiers.get(77), 0b0001_0000);
    assert_eq!(modifiers.get(66), 0);
    let set = modifiers.as_bytes().iter().filter(|bits| **bits != 0).count();
    assert_eq!(set, 8);
}
