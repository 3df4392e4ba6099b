#![allow(dead_code)] // each test binary uses a subset of the harness
//! In-process stand-ins for the RAID server.
//!
//! `SimBus` implements `RaidBus` directly over shared in-memory disks so
//! engine tests can inspect every exchange; `spawn_server` runs the same
//! array behind a real TCP socket for end-to-end coverage.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::thread::JoinHandle;
use tagline_bus::{BusConfig, Payload, RaidBus};
use tagline_driver::DriverConfig;
use tagline_error::{Result, TagError};
use tagline_types::ArrayGeometry;
use tagline_wire::{RaidOp, RequestType, DISK_FAILED};

const DISK_READY: u32 = 1;

/// Small array geometry shared by the engine tests.
pub fn test_geometry() -> ArrayGeometry {
    ArrayGeometry {
        disk_count: 4,
        disk_blocks: 64,
        block_size: 32,
        track_blocks: 16,
        max_tag_blocks: 16,
    }
}

/// Driver config over the test geometry with a pinned seed.
pub fn test_config(max_tags: u32) -> DriverConfig {
    DriverConfig {
        max_tags,
        cache_capacity: 8,
        seed: Some(1),
        geometry: test_geometry(),
        ..DriverConfig::default()
    }
}

/// Simulated RAID array state.
pub struct SimState {
    geometry: ArrayGeometry,
    disks: Vec<Vec<u8>>,
    condition: Vec<u32>,
    connected: bool,
    /// Every request seen, in order.
    pub ops: Vec<RaidOp>,
    /// Fail the exchange whose zero-based index equals this.
    pub fail_at: Option<usize>,
}

impl SimState {
    pub fn new(geometry: ArrayGeometry) -> Self {
        let disk_bytes = geometry.disk_blocks as usize * geometry.block_size;
        Self {
            geometry,
            disks: vec![vec![0_u8; disk_bytes]; usize::from(geometry.disk_count)],
            condition: vec![DISK_READY; usize::from(geometry.disk_count)],
            connected: false,
            ops: Vec::new(),
            fail_at: None,
        }
    }

    /// Simulate a disk failure: the server loses the disk's contents and
    /// reports `DISK_FAILED` on the next STATUS.
    pub fn fail_disk(&mut self, disk: u8) {
        self.condition[usize::from(disk)] = DISK_FAILED;
        self.disks[usize::from(disk)].fill(0xDB);
    }

    /// Raw bytes of `count` blocks at `offset` on `disk`.
    pub fn disk_bytes(&self, disk: u8, offset: u32, count: u32) -> &[u8] {
        let block_size = self.geometry.block_size;
        let start = offset as usize * block_size;
        &self.disks[usize::from(disk)][start..start + count as usize * block_size]
    }

    pub fn ops_of_type(&self, kind: RequestType) -> Vec<RaidOp> {
        self.ops
            .iter()
            .copied()
            .filter(|op| op.request == kind)
            .collect()
    }

    /// Apply one request; `inbound` is the WRITE payload when present.
    /// Returns the response opcode and the READ payload when present.
    pub fn handle(
        &mut self,
        request: RaidOp,
        inbound: Option<&[u8]>,
    ) -> Result<(RaidOp, Option<Vec<u8>>)> {
        if self.fail_at == Some(self.ops.len()) {
            self.ops.push(request);
            return Err(TagError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "injected transport failure",
            )));
        }
        self.ops.push(request);

        if request.request == RequestType::Init {
            self.connected = true;
        }
        assert!(self.connected, "exchange before INIT");

        let block_size = self.geometry.block_size;
        let mut response = request;
        let mut outbound = None;
        match request.request {
            RequestType::Init | RequestType::Close => {
                if request.request == RequestType::Close {
                    self.connected = false;
                }
            }
            RequestType::Format => {
                let disk = usize::from(request.disk);
                self.disks[disk].fill(0);
                self.condition[disk] = DISK_READY;
            }
            RequestType::Read => {
                let start = request.id as usize * block_size;
                let len = usize::from(request.block_quantity) * block_size;
                let disk = &self.disks[usize::from(request.disk)];
                assert!(start + len <= disk.len(), "READ beyond disk end");
                outbound = Some(disk[start..start + len].to_vec());
            }
            RequestType::Write => {
                let payload = inbound.expect("WRITE without payload");
                let start = request.id as usize * block_size;
                let disk = &mut self.disks[usize::from(request.disk)];
                assert!(start + payload.len() <= disk.len(), "WRITE beyond disk end");
                disk[start..start + payload.len()].copy_from_slice(payload);
            }
            RequestType::Status => {
                response.id = self.condition[usize::from(request.disk)];
            }
        }
        Ok((response, outbound))
    }
}

/// `RaidBus` over a shared `SimState`; clone one handle for assertions.
#[derive(Clone)]
pub struct SimBus {
    state: Rc<RefCell<SimState>>,
}

impl SimBus {
    pub fn new(geometry: ArrayGeometry) -> Self {
        Self {
            state: Rc::new(RefCell::new(SimState::new(geometry))),
        }
    }

    pub fn state(&self) -> std::cell::RefMut<'_, SimState> {
        self.state.borrow_mut()
    }
}

impl RaidBus for SimBus {
    fn exchange(&mut self, request: RaidOp, payload: Payload<'_>) -> Result<RaidOp> {
        let mut state = self.state.borrow_mut();
        match payload {
            Payload::None => {
                let (response, _) = state.handle(request, None)?;
                Ok(response)
            }
            Payload::Write(buf) => {
                let (response, _) = state.handle(request, Some(buf))?;
                Ok(response)
            }
            Payload::Read(buf) => {
                let (response, outbound) = state.handle(request, None)?;
                let bytes = outbound.expect("READ response without payload");
                buf.copy_from_slice(&bytes);
                Ok(response)
            }
        }
    }
}

/// Run a `SimState` behind a real TCP socket, one connection, until CLOSE.
/// Returns the bus config pointing at it.
pub fn spawn_server(geometry: ArrayGeometry) -> (BusConfig, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let handle = std::thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        serve_connection(stream, SimState::new(geometry));
    });
    (
        BusConfig {
            addr: "127.0.0.1".to_owned(),
            port,
        },
        handle,
    )
}

fn serve_connection(mut stream: TcpStream, mut state: SimState) {
    let block_size = state.geometry.block_size;
    loop {
        let mut word = [0_u8; 8];
        stream.read_exact(&mut word).expect("request opcode");
        let request = RaidOp::decode(u64::from_be_bytes(word)).expect("decodable request");
        stream.read_exact(&mut word).expect("request length");
        let announced = u64::from_be_bytes(word) as usize;

        let inbound = if request.request == RequestType::Write {
            assert_eq!(
                announced,
                usize::from(request.block_quantity) * block_size,
                "WRITE length word"
            );
            let mut payload = vec![0_u8; announced];
            stream.read_exact(&mut payload).expect("WRITE payload");
            Some(payload)
        } else {
            None
        };

        let (response, outbound) = state
            .handle(request, inbound.as_deref())
            .expect("server-side failure injection is not used over TCP");

        stream
            .write_all(&response.encode().to_be_bytes())
            .expect("response opcode");
        let outbound = outbound.unwrap_or_default();
        stream
            .write_all(&(outbound.len() as u64).to_be_bytes())
            .expect("response length");
        stream.write_all(&outbound).expect("response payload");

        if request.request == RequestType::Close {
            break;
        }
    }
}
