//! Transactions against memory behind a callout driver.

mod common;

use common::{BASE, Call, Notifications, Ram, ScriptedDriver, ThreadPartition, init_logging};
use xcp_memproxy::batch::DescriptorRing;
use xcp_memproxy::bitfield::BitModify;
use xcp_memproxy::callout::CalloutDriver;
use xcp_memproxy::memory::MemoryArea;
use xcp_memproxy::state::ProxyPhase;
use xcp_memproxy::{Error, MemoryProxy, Outcome, ProxyRequest, Result};

const FLASH: usize = 1;
const ADDR: u32 = 0x8000_0400;

struct Fixture {
    ram: Ram,
    driver: ScriptedDriver,
    ring: DescriptorRing<4>,
    notes: Notifications,
    runtime: ThreadPartition,
}

impl Fixture {
    fn new() -> Self {
        init_logging();
        Self {
            ram: Ram::new(BASE, 64),
            driver: ScriptedDriver::default(),
            ring: DescriptorRing::new(),
            notes: Notifications::new(),
            runtime: ThreadPartition,
        }
    }
}

macro_rules! proxy {
    ($fx:ident, $areas:ident, $proxy:ident) => {
        let $areas = [MemoryArea::plain(), MemoryArea::callout(&$fx.driver)];
        let $proxy: MemoryProxy<'_, &Ram, 16, 4> =
            MemoryProxy::new(&$fx.ram, &$areas, &$fx.ring, &$fx.notes, &$fx.runtime);
    };
}

#[test]
fn upload_completes_on_read_callback() {
    let fx = Fixture::new();
    proxy!(fx, areas, proxy);

    assert_eq!(proxy.handle(ProxyRequest::upload(FLASH, ADDR, 3)), Outcome::Pending);
    assert_eq!(fx.driver.take(), vec![Call::Read { addr: ADDR, len: 3 }]);
    assert_eq!(proxy.phase(), ProxyPhase::Busy);
    assert!(!proxy.callout_idle());

    proxy.on_read_complete(Ok(&[7, 8, 9]));
    assert_eq!(proxy.phase(), ProxyPhase::Ready);
    assert!(proxy.callout_idle());
    assert_eq!(fx.notes.take(), vec![None]);
    assert_eq!(proxy.read_result(|data| data.to_vec()), Ok(vec![7, 8, 9]));
}

#[test]
fn download_completes_on_write_callback() {
    let fx = Fixture::new();
    proxy!(fx, areas, proxy);

    let mut tx = proxy.try_acquire().unwrap();
    tx.buffer_mut()[..2].copy_from_slice(&[0xCA, 0xFE]);
    assert_eq!(tx.submit(ProxyRequest::download(FLASH, ADDR, 2)), Outcome::Pending);
    assert_eq!(
        fx.driver.take(),
        vec![Call::Write {
            addr: ADDR,
            data: vec![0xCA, 0xFE]
        }]
    );

    proxy.on_write_complete(Ok(()));
    assert_eq!(proxy.phase(), ProxyPhase::Ready);
    assert_eq!(fx.notes.take(), vec![None]);
}

#[test]
fn modify_bits_reads_then_writes() {
    let fx = Fixture::new();
    proxy!(fx, areas, proxy);

    let modify = BitModify::new(0, 0x00F0, 0x0010);
    assert_eq!(
        proxy.handle(ProxyRequest::modify_bits(FLASH, ADDR, modify)),
        Outcome::Pending
    );
    assert_eq!(fx.driver.take(), vec![Call::Read { addr: ADDR, len: 4 }]);

    proxy.on_read_complete(Ok(&0x0000_0F00u32.to_le_bytes()));
    assert_eq!(
        fx.driver.take(),
        vec![Call::Write {
            addr: ADDR,
            data: vec![0x10, 0, 0, 0]
        }]
    );
    assert_eq!(proxy.phase(), ProxyPhase::Busy);
    assert!(fx.notes.take().is_empty());

    proxy.on_write_complete(Ok(()));
    assert_eq!(proxy.phase(), ProxyPhase::Ready);
    assert_eq!(fx.notes.take(), vec![None]);
}

#[test]
fn failed_read_ends_available() {
    let fx = Fixture::new();
    proxy!(fx, areas, proxy);

    proxy.handle(ProxyRequest::upload(FLASH, ADDR, 4));
    proxy.on_read_complete(Err(Error::Driver));
    assert_eq!(proxy.phase(), ProxyPhase::Available);
    assert!(proxy.callout_idle());
    assert!(fx.notes.take().is_empty());
}

#[test]
fn failed_write_of_modify_ends_available() {
    let fx = Fixture::new();
    proxy!(fx, areas, proxy);

    proxy.handle(ProxyRequest::modify_bits(FLASH, ADDR, BitModify::new(0, 0, 1)));
    proxy.on_read_complete(Ok(&[0; 4]));
    proxy.on_write_complete(Err(Error::Driver));
    assert_eq!(proxy.phase(), ProxyPhase::Available);
    assert!(proxy.callout_idle());
    assert!(fx.notes.take().is_empty());
}

#[test]
fn short_read_is_a_failure() {
    let fx = Fixture::new();
    proxy!(fx, areas, proxy);

    proxy.handle(ProxyRequest::upload(FLASH, ADDR, 4));
    proxy.on_read_complete(Ok(&[1, 2]));
    assert_eq!(proxy.phase(), ProxyPhase::Available);
    assert!(proxy.callout_idle());
}

#[test]
fn refused_issue_fails_at_once() {
    let fx = Fixture::new();
    proxy!(fx, areas, proxy);

    fx.driver.refuse(true);
    assert_eq!(
        proxy.handle(ProxyRequest::upload(FLASH, ADDR, 4)),
        Outcome::Failed(Error::Driver)
    );
    assert_eq!(proxy.phase(), ProxyPhase::Available);
    assert!(proxy.callout_idle());
}

#[test]
fn refused_write_of_modify_ends_available() {
    let fx = Fixture::new();
    proxy!(fx, areas, proxy);

    proxy.handle(ProxyRequest::modify_bits(FLASH, ADDR, BitModify::new(0, 0, 1)));
    fx.driver.refuse(true);
    proxy.on_read_complete(Ok(&[0; 4]));
    assert_eq!(proxy.phase(), ProxyPhase::Available);
    assert!(proxy.callout_idle());
    assert!(fx.notes.take().is_empty());

    // A late write completion finds nothing outstanding
    proxy.on_write_complete(Ok(()));
    assert_eq!(proxy.phase(), ProxyPhase::Available);
    assert!(fx.notes.take().is_empty());
}

#[test]
fn stale_completions_change_nothing() {
    let fx = Fixture::new();
    proxy!(fx, areas, proxy);

    // Nothing outstanding at all
    proxy.on_read_complete(Ok(&[1; 4]));
    proxy.on_write_complete(Ok(()));
    assert_eq!(proxy.phase(), ProxyPhase::Available);
    assert!(fx.notes.take().is_empty());

    // Duplicate after a completed upload
    proxy.handle(ProxyRequest::upload(FLASH, ADDR, 2));
    proxy.on_read_complete(Ok(&[5, 6]));
    proxy.on_read_complete(Ok(&[7, 8]));
    proxy.on_read_complete(Err(Error::Driver));
    assert_eq!(proxy.phase(), ProxyPhase::Ready);
    assert_eq!(fx.notes.take(), vec![None]);
    assert_eq!(proxy.read_result(|data| data.to_vec()), Ok(vec![5, 6]));
}

#[test]
fn write_completion_cannot_end_a_pending_read() {
    let fx = Fixture::new();
    proxy!(fx, areas, proxy);

    proxy.handle(ProxyRequest::upload(FLASH, ADDR, 2));
    proxy.on_write_complete(Ok(()));
    assert_eq!(proxy.phase(), ProxyPhase::Busy);
    assert!(!proxy.callout_idle());

    proxy.on_read_complete(Ok(&[1, 2]));
    assert_eq!(proxy.phase(), ProxyPhase::Ready);
}

#[test]
fn interrupted_callout_drops_its_result() {
    let fx = Fixture::new();
    proxy!(fx, areas, proxy);

    proxy.handle(ProxyRequest::upload(FLASH, ADDR, 2));
    assert_eq!(proxy.handle(ProxyRequest::upload(FLASH, ADDR, 2)), Outcome::Busy);
    assert!(proxy.is_interrupted());

    proxy.on_read_complete(Ok(&[1, 2]));
    assert_eq!(proxy.phase(), ProxyPhase::Available);
    assert!(fx.notes.take().is_empty());

    // The engine can now reissue
    assert_eq!(proxy.handle(ProxyRequest::upload(FLASH, ADDR, 2)), Outcome::Pending);
}

#[test]
fn completion_from_another_thread() {
    let fx = Fixture::new();
    proxy!(fx, areas, proxy);

    proxy.handle(ProxyRequest::upload(FLASH, ADDR, 4));
    std::thread::scope(|s| {
        s.spawn(|| proxy.on_read_complete(Ok(&[4, 3, 2, 1])));
    });
    assert_eq!(proxy.read_result(|data| data.to_vec()), Ok(vec![4, 3, 2, 1]));
    assert_eq!(fx.notes.take(), vec![None]);
}

// A driver which completes from inside the issuing call.
struct Immediate;

static IMMEDIATE: Immediate = Immediate;
static IMMEDIATE_RAM: Ram = Ram::empty(BASE);
static IMMEDIATE_AREAS: [MemoryArea<'static>; 1] = [MemoryArea::callout(&IMMEDIATE)];
static IMMEDIATE_RING: DescriptorRing<1> = DescriptorRing::new();
static IMMEDIATE_NOTES: Notifications = Notifications::new();
static IMMEDIATE_PROXY: MemoryProxy<'static, &'static Ram, 8, 1> = MemoryProxy::new(
    &IMMEDIATE_RAM,
    &IMMEDIATE_AREAS,
    &IMMEDIATE_RING,
    &IMMEDIATE_NOTES,
    &ThreadPartition,
);

impl CalloutDriver for Immediate {
    fn async_read(&self, _addr: u32, len: usize) -> Result<()> {
        IMMEDIATE_PROXY.on_read_complete(Ok(&[0xF0, 0xFF, 0xFF, 0xFF][..len]));
        Ok(())
    }

    fn async_write(&self, _addr: u32, _data: &[u8]) -> Result<()> {
        IMMEDIATE_PROXY.on_write_complete(Ok(()));
        Ok(())
    }
}

#[test]
fn completion_inside_the_issuing_call() {
    init_logging();
    let modify = BitModify::new(0, 0xFF00, 0x000F);
    assert_eq!(
        IMMEDIATE_PROXY.handle(ProxyRequest::modify_bits(0, ADDR, modify)),
        Outcome::Pending
    );
    assert_eq!(IMMEDIATE_PROXY.phase(), ProxyPhase::Ready);
    assert!(IMMEDIATE_PROXY.callout_idle());
    assert_eq!(IMMEDIATE_NOTES.take(), vec![None]);
    assert_eq!(
        IMMEDIATE_PROXY.read_result(|data| data.to_vec()),
        Ok(vec![0x0F, 0xFF, 0xFF, 0xFF])
    );
}
