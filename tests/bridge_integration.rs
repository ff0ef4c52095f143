//! Exercises the bridge's pumps and the device catalogue against a
//! real broker on a loopback port.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use vcamcore::broker::Service;
use vcamcore::fraction::Fraction;
use vcamcore::format::{FourCc, VideoFormat};
use vcamcore::frame::VideoFrame;
use vcamcore::preferences::Preferences;
use vcamcore::{IpcBridge, StreamType};

fn start_broker(port: u16) -> (Arc<Service>, thread::JoinHandle<()>) {
    let service = Arc::new(Service::with_port(port));
    let runner = Arc::clone(&service);
    let handle = thread::spawn(move || {
        let _ = runner.run();
    });
    thread::sleep(Duration::from_millis(100));
    (service, handle)
}

#[test]
fn input_pump_delivers_written_frames_to_an_output_pump() {
    let (service, handle) = start_broker(37720);

    let source_preferences = Preferences::memory();
    source_preferences.set_service_port(service.port());
    let source = IpcBridge::new(source_preferences);

    let sink_preferences = Preferences::memory();
    sink_preferences.set_service_port(service.port());
    let sink = IpcBridge::new(sink_preferences);

    let received = Arc::new(AtomicUsize::new(0));
    {
        let received = Arc::clone(&received);
        sink.on_frame_ready(move |_device_id, frame, _is_active| {
            if !frame.is_empty() {
                received.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    assert!(source.device_start(StreamType::Input, "AkVCamVideoDevice0"));
    assert!(sink.device_start(StreamType::Output, "AkVCamVideoDevice0"));

    let format = VideoFormat::new(FourCc::new("RGB3"), 2, 2, vec![Fraction::new(30, 1)]);
    let frame = VideoFrame::new(format, vec![0x42; 12]);
    assert!(source.write("AkVCamVideoDevice0", frame));

    thread::sleep(Duration::from_millis(300));
    assert!(received.load(Ordering::SeqCst) >= 1);

    source.device_stop("AkVCamVideoDevice0");
    sink.device_stop("AkVCamVideoDevice0");
    service.stop();
    let _ = handle.join();
}

#[test]
fn add_device_is_visible_through_the_bridge_and_busy_tracks_clients() {
    let (service, handle) = start_broker(37721);

    let preferences = Preferences::memory();
    preferences.set_service_port(service.port());
    let bridge = IpcBridge::new(preferences);

    let id = bridge.add_device("integration test camera", "");
    assert_eq!(id, "AkVCamVideoDevice0");
    assert!(bridge.devices().contains(&id));
    assert_eq!(bridge.controls(&id).get("vflip"), Some(&0));

    assert!(!bridge.is_busy_for(vcamcore::Operation::AddDevice));

    service.stop();
    let _ = handle.join();
}
