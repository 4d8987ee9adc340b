//! End to end tests against a fake 7k center on the loopback interface

use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream, UdpSocket};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use seven_link::frame::{encode_network, encode_record, RecordTime, NETWORK_FRAME_SIZE};
use seven_link::record::{PingSettings, SystemSettings};
use seven_link::{Client, ClientConfig, Command, RecordType, Via};

const TIMEOUT: Duration = Duration::from_secs(5);

fn u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

fn f32_at(buf: &[u8], at: usize) -> f32 {
    f32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

fn message(code: u32, data: &[u8]) -> Vec<u8> {
    let time = RecordTime {
        year: 2014,
        day_of_year: 176,
        seconds: 3.25,
        hour: 9,
        minute: 41,
    };
    encode_network(7125, 0, &encode_record(code, 7125, 0, time, data))
}

fn put(data: &mut [u8], at: usize, value: f32) {
    data[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn ping(gain: f32) -> Vec<u8> {
    let mut data = vec![0u8; 160];
    put(&mut data, PingSettings::FREQUENCY_AT, 396_000.0);
    put(&mut data, PingSettings::POWER_AT, 200.0);
    put(&mut data, PingSettings::GAIN_AT, gain);
    message(7000, &data)
}

fn system_settings() -> Vec<u8> {
    let mut data = vec![0u8; 200];
    put(&mut data, SystemSettings::FREQUENCY_AT, 396_000.0);
    put(&mut data, SystemSettings::PING_RATE_AT, 10.0);
    put(&mut data, SystemSettings::RANGE_AT, 50.0);
    put(&mut data, SystemSettings::POWER_AT, 210.0);
    put(&mut data, SystemSettings::GAIN_AT, 30.0);
    put(&mut data, SystemSettings::ABSORPTION_AT, 40.0);
    put(&mut data, SystemSettings::SPREADING_AT, 30.0);
    message(7503, &data)
}

/// A command as the fake device saw it: record type, control id and whole message
#[derive(Debug, Clone)]
struct Received {
    record_type: u32,
    control: Option<u32>,
    bytes: Vec<u8>,
}

impl Received {
    fn parse(bytes: Vec<u8>) -> Self {
        let record_type = u32_at(&bytes, NETWORK_FRAME_SIZE + 32);
        let control = (record_type == 7500).then(|| u32_at(&bytes, NETWORK_FRAME_SIZE + 64));
        Self {
            record_type,
            control,
            bytes,
        }
    }

    /// First parameter after the remote control sub-header
    fn parameter_at(&self, offset: usize) -> &[u8] {
        &self.bytes[NETWORK_FRAME_SIZE + 64 + 24 + offset..]
    }
}

fn read_message(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut header = [0u8; NETWORK_FRAME_SIZE];
    stream.read_exact(&mut header).ok()?;
    let size = u32_at(&header, 12) as usize;
    let mut rest = vec![0u8; size - NETWORK_FRAME_SIZE];
    stream.read_exact(&mut rest).ok()?;
    let mut message = header.to_vec();
    message.extend(rest);
    Some(message)
}

struct FakeDevice {
    port: u16,
    tcp: Receiver<Received>,
    udp: Receiver<Received>,
}

/// Acks every TCP command and answers singlerequest(7503). A UDP selfrecordrequest is
/// answered by sending `stream` to the requesting port.
fn spawn_device(stream: Vec<Vec<u8>>) -> FakeDevice {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    let udp = UdpSocket::bind((Ipv4Addr::LOCALHOST, port)).unwrap();
    udp.set_read_timeout(Some(TIMEOUT)).unwrap();

    let (tcp_tx, tcp_rx) = mpsc::channel();
    thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        while let Some(bytes) = read_message(&mut conn) {
            let received = Received::parse(bytes);
            if let Some(control) = received.control {
                let mut ack = control.to_le_bytes().to_vec();
                ack.extend([0u8; 16]);
                conn.write_all(&message(7501, &ack)).unwrap();
                if control == 1050 && u32_at(received.parameter_at(0), 0) == 7503 {
                    conn.write_all(&system_settings()).unwrap();
                }
            }
            let _ = tcp_tx.send(received);
        }
    });

    let (udp_tx, udp_rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = vec![0u8; 65535];
        let Ok((n, from)) = udp.recv_from(&mut buf) else {
            return;
        };
        let received = Received::parse(buf[..n].to_vec());
        let subscribe = received.control == Some(1051);
        let _ = udp_tx.send(received);
        if subscribe {
            // Give the client time to bind its receiver
            thread::sleep(Duration::from_millis(200));
            for datagram in &stream {
                udp.send_to(datagram, from).unwrap();
                thread::sleep(Duration::from_millis(5));
            }
        }
    });

    FakeDevice {
        port,
        tcp: tcp_rx,
        udp: udp_rx,
    }
}

fn connect(device: &FakeDevice) -> Client {
    Client::connect(ClientConfig {
        device_port: device.port,
        reply_timeout: TIMEOUT,
        udp_read_timeout: Duration::from_millis(50),
        tcp_read_timeout: Duration::from_millis(50),
        ..ClientConfig::default()
    })
    .unwrap()
}

#[test]
fn commands_reach_the_device() {
    let device = spawn_device(Vec::new());
    let mut client = connect(&device);
    client.command(&Command::Gain(12.0), Via::Tcp).unwrap();
    client.command(&Command::Absorption(0.0), Via::Tcp).unwrap();

    let gain = device.tcp.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(gain.control, Some(1008));
    assert_eq!(f32_at(gain.parameter_at(0), 0), 12.0);
    let absorption = device.tcp.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(absorption.record_type, 7611);
    assert_eq!(absorption.control, None);

    // Both were acknowledged
    for _ in 0..2 {
        let reply = client.replies().recv_timeout(TIMEOUT).unwrap();
        assert_eq!(reply.record_type, RecordType::RemoteControlAck);
    }
    client.close().unwrap();
    assert!(!client.is_connected());
}

#[test]
fn settings_and_enumerator() {
    let device = spawn_device(Vec::new());
    let mut client = connect(&device);
    let settings = client.request_settings(TIMEOUT).unwrap().unwrap();
    assert_eq!(settings.frequency, 396_000.0);
    assert_eq!(settings.power, 210.0);
    assert_eq!(settings.absorption, 40.0);

    assert_eq!(client.detect_enumerator().unwrap(), Some(1));
    client.command(&Command::Stop, Via::Tcp).unwrap();
    let stop = device.tcp.iter().find(|r| r.control == Some(1201)).unwrap();
    // System enumerator of the data record frame
    assert_eq!(u32_at(&stop.bytes, NETWORK_FRAME_SIZE + 40), 1);
    client.close().unwrap();
}

#[test]
fn udp_subscription_bundles_pings() {
    let bathymetry = message(7006, &[1; 40]);
    let stream = vec![
        bathymetry.clone(),
        ping(6.0),
        bathymetry.clone(),
        b"garbage".to_vec(),
        ping(6.0),
    ];
    let device = spawn_device(stream);
    let mut client = connect(&device);

    let subscription = client
        .subscribe_udp(vec![RecordType::Ping, RecordType::Bathymetry])
        .unwrap();
    let request = device.udp.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(request.control, Some(1051));
    assert_eq!(u32_at(request.parameter_at(0), 0), 2);

    let first = client.bundles().recv_timeout(TIMEOUT).unwrap();
    assert_eq!(first.record_types().collect::<Vec<_>>(), vec![RecordType::Bathymetry]);
    let second = client.bundles().recv_timeout(TIMEOUT).unwrap();
    assert_eq!(
        second.record_types().collect::<Vec<_>>(),
        vec![RecordType::Ping, RecordType::Bathymetry]
    );
    assert_eq!(second.ping_settings().unwrap().gain, 6.0);
    assert!(client.sweep().wait_for_count(2, TIMEOUT));

    client.unsubscribe().unwrap();
    assert!(client.subscription().is_none());
    let stop = device
        .tcp
        .iter()
        .find(|r| r.control == Some(1054))
        .unwrap();
    // Port of the stop request is the subscribed port
    let port = u16::from_le_bytes(stop.parameter_at(4)[..2].try_into().unwrap());
    assert_eq!(port, subscription.port);
    client.close().unwrap();
}

/// Collects captured bytes where the test can see them
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn raw_capture_strips_network_frames() {
    let stream = vec![ping(3.0), ping(3.0), message(7027, &[9; 24])];
    let device = spawn_device(stream.clone());
    let mut client = connect(&device);
    let captured = SharedBuf::default();
    client
        .capture_udp(vec![RecordType::Ping], captured.clone())
        .unwrap();
    assert!(client.sweep().wait_for_count(2, TIMEOUT));

    let expected: Vec<u8> = stream
        .iter()
        .flat_map(|m| m[NETWORK_FRAME_SIZE..].to_vec())
        .collect();
    let deadline = Instant::now() + TIMEOUT;
    while captured.0.lock().unwrap().len() < expected.len() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    client.close().unwrap();
    assert_eq!(*captured.0.lock().unwrap(), expected);
}

#[test]
fn stop_request_for_stale_subscription() {
    let device = spawn_device(Vec::new());
    let mut client = connect(&device);
    client
        .stop_request(40000, seven_link::DeliveryKind::Tcp)
        .unwrap();
    let stop = device.tcp.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(stop.control, Some(1054));
    let ip = u32_at(stop.parameter_at(0), 0);
    assert_eq!(Ipv4Addr::from(ip), Ipv4Addr::LOCALHOST);
    assert_eq!(u16::from_le_bytes(stop.parameter_at(4)[..2].try_into().unwrap()), 40000);
    assert_eq!(u16::from_le_bytes(stop.parameter_at(6)[..2].try_into().unwrap()), 1);
    client.close().unwrap();
}

#[test]
fn device_hang_up_reaches_the_caller() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    let (sent_tx, sent_rx) = mpsc::channel();
    thread::spawn(move || {
        drop(listener.accept().unwrap());
        // The reconnect gets a session that reads commands
        let (mut conn, _) = listener.accept().unwrap();
        while let Some(bytes) = read_message(&mut conn) {
            let _ = sent_tx.send(Received::parse(bytes));
        }
    });
    let mut client = Client::connect(ClientConfig {
        device_port: port,
        tcp_read_timeout: Duration::from_millis(50),
        ..ClientConfig::default()
    })
    .unwrap();

    thread::sleep(Duration::from_millis(200));
    assert!(!client.is_connected());
    assert!(matches!(
        client.command(&Command::Gain(3.0), Via::Tcp),
        Err(seven_link::Error::ConnectionClosed)
    ));

    client.reconnect().unwrap();
    assert!(client.is_connected());
    client.command(&Command::Gain(3.0), Via::Tcp).unwrap();
    let gain = sent_rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(gain.control, Some(1008));
    client.close().unwrap();
}
