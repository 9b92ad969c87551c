// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

//! A `std::sync`-backed [`Substrate`] for tests, modeled on the reference
//! kernel's own `hosted` backend: semaphores over `Mutex`+`Condvar`, page
//! tables as plain `Vec<Pte>`, and a swap "disk" as an in-memory byte buffer.
//! Pager workers are real OS threads; `fork_pager` spawns one per call.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use crate::disk::{BlockLocation, DiskGeometry};
use crate::ids::{Frame, Pid};
use crate::mmu::{AccessFlags, FaultCause, Pte, PageTableOps};
use crate::substrate::{Semaphore, Substrate};

thread_local! {
    static CURRENT_PID: Cell<u32> = Cell::new(1);
}

pub struct MockSemaphore {
    count: Mutex<isize>,
    cvar: Condvar,
}

impl Semaphore for MockSemaphore {
    fn p(&self) {
        let mut count = self.count.lock().unwrap();
        while *count <= 0 {
            count = self.cvar.wait(count).unwrap();
        }
        *count -= 1;
    }

    fn v(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cvar.notify_one();
    }
}

#[derive(Clone)]
pub struct MockPageTable(Arc<Mutex<Vec<Pte>>>);

impl PageTableOps for MockPageTable {
    fn get(&self, page: crate::ids::Page) -> Pte { self.0.lock().unwrap()[page.0] }
    fn set(&self, page: crate::ids::Page, pte: Pte) { self.0.lock().unwrap()[page.0] = pte; }
    fn len(&self) -> usize { self.0.lock().unwrap().len() }
}

pub struct MockSubstrate {
    page_size: usize,
    mmu_base: usize,
    mmu_pages: usize,
    page_table_len: usize,
    geometry: DiskGeometry,
    disk: Mutex<Vec<u8>>,
    page_tables: Mutex<HashMap<Pid, MockPageTable>>,
    access: Mutex<HashMap<Frame, AccessFlags>>,
    fault_handler: Mutex<Option<Arc<dyn Fn(FaultCause, usize) + Send + Sync>>>,
    fault_cause: Mutex<FaultCause>,
    next_pid: Mutex<u32>,
}

impl MockSubstrate {
    pub fn new(page_size: usize, mmu_pages: usize, page_table_len: usize, geometry: DiskGeometry) -> Arc<MockSubstrate> {
        Arc::new(MockSubstrate {
            page_size,
            mmu_base: 0x1000_0000,
            mmu_pages,
            page_table_len,
            disk: Mutex::new(vec![0u8; geometry.total_bytes()]),
            geometry,
            page_tables: Mutex::new(HashMap::new()),
            access: Mutex::new(HashMap::new()),
            fault_handler: Mutex::new(None),
            fault_cause: Mutex::new(FaultCause::NotPresent),
            next_pid: Mutex::new(2),
        })
    }

    fn byte_offset(&self, location: BlockLocation) -> usize {
        let sector = location.track * self.geometry.sectors_per_track + location.sector;
        sector * self.geometry.sector_bytes
    }

    /// Test helper: allocates a fresh pid without forking a thread, for
    /// tests that simulate several user processes on the calling thread.
    pub fn alloc_pid(&self) -> Pid {
        let mut next = self.next_pid.lock().unwrap();
        let pid = Pid::new(*next).expect("pid within MAX_PROC");
        *next += 1;
        pid
    }

    /// Test helper: runs the installed fault handler as if `pid` faulted on
    /// `offset` with `cause`, on the calling thread.
    pub fn raise_fault(&self, pid: Pid, cause: FaultCause, offset: usize) {
        CURRENT_PID.with(|c| c.set(pid.get()));
        *self.fault_cause.lock().unwrap() = cause;
        let handler = self.fault_handler.lock().unwrap().clone().expect("fault handler installed");
        handler(cause, offset);
    }
}

impl Substrate for MockSubstrate {
    type Semaphore = MockSemaphore;
    type PageTable = MockPageTable;

    fn page_size(&self) -> usize { self.page_size }

    fn mmu_region(&self) -> (usize, usize) { (self.mmu_base, self.mmu_pages) }

    fn mmu_get_cause(&self) -> FaultCause { *self.fault_cause.lock().unwrap() }

    fn mmu_get_access(&self, frame: Frame) -> AccessFlags {
        *self.access.lock().unwrap().get(&frame).unwrap_or(&AccessFlags::empty())
    }

    fn mmu_set_access(&self, frame: Frame, flags: AccessFlags) {
        self.access.lock().unwrap().insert(frame, flags);
    }

    fn page_table(&self, pid: Pid) -> Self::PageTable {
        self.page_tables
            .lock()
            .unwrap()
            .entry(pid)
            .or_insert_with(|| MockPageTable(Arc::new(Mutex::new(vec![Pte::empty(); self.page_table_len]))))
            .clone()
    }

    fn install_page_table(&self, _pid: Pid, _table: &Self::PageTable) {
        // The mock hands out one shared handle per pid; installing is a
        // no-op because every holder already observes the same table.
    }

    fn disk_geometry(&self) -> DiskGeometry { self.geometry }

    fn disk_read(&self, location: BlockLocation, buf: &mut [u8]) {
        let disk = self.disk.lock().unwrap();
        let offset = self.byte_offset(location);
        buf.copy_from_slice(&disk[offset..offset + buf.len()]);
    }

    fn disk_write(&self, location: BlockLocation, buf: &[u8]) {
        let mut disk = self.disk.lock().unwrap();
        let offset = self.byte_offset(location);
        disk[offset..offset + buf.len()].copy_from_slice(buf);
    }

    fn sem_create(&self, initial: isize) -> Self::Semaphore {
        MockSemaphore { count: Mutex::new(initial), cvar: Condvar::new() }
    }

    fn current_pid(&self) -> Pid { Pid::new(CURRENT_PID.with(|c| c.get())).expect("current pid set") }

    fn terminate(&self, code: i32) -> ! { panic!("process terminated with code {}", code) }

    fn install_fault_handler(&self, handler: Box<dyn Fn(FaultCause, usize) + Send + Sync>) {
        *self.fault_handler.lock().unwrap() = Some(Arc::from(handler));
    }

    fn fork_pager(&self, name: &str, entry: Box<dyn FnOnce() + Send>) -> Pid {
        let pid = self.alloc_pid();
        let raw = pid.get();
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                CURRENT_PID.with(|c| c.set(raw));
                entry();
            })
            .expect("spawn pager worker thread");
        pid
    }
}
