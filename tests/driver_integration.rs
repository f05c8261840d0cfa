/*
Copyright 2025  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

mod common;

use common::{TestArch, TestExecutor, TestHost, TestLoader, TestMemory};
use worldswitch::config::VmmConfiguration;
use worldswitch::driver::ContextSwitchDriver;
use worldswitch::driver::host_call::HostCallOp;
use worldswitch::mem::ptr_addr_space::AddressSpace;
use worldswitch::services::{RunExit, TerminalStatus};
use worldswitch::snapshot;
use worldswitch::switcher::{self, SwitcherKind};

fn new_driver(mem: &mut TestMemory) -> ContextSwitchDriver {
    let config = VmmConfiguration::default();
    ContextSwitchDriver::new(&config, mem).unwrap()
}

#[test]
fn every_present_switcher_resolves_entry_points_from_the_layout() {
    let mut mem = TestMemory::new();
    let mut driver = new_driver(&mut mem);

    for def in switcher::present() {
        driver.select_switcher(def.kind).unwrap();
        driver
            .relocate(0, &mem, &TestLoader::new(), &TestArch)
            .unwrap();

        let image = driver.image();
        let blob = u64::from(image.offset_of(def.kind).unwrap());
        let host_base = image.tri().host().base();
        let guest_base = image.tri().guest().base();

        let active = driver.active().unwrap();
        assert_eq!(
            host_base + blob + u64::from(def.off_host_to_guest),
            active.host_to_guest
        );
        assert_eq!(
            guest_base + blob + u64::from(def.off_guest_to_host),
            active.guest_to_host
        );
        assert_eq!(
            guest_base + blob + u64::from(def.off_call_trampoline),
            active.call_trampoline
        );
        assert_eq!(
            guest_base + blob + u64::from(def.off_guest_to_host_asm),
            active.guest_to_host_asm
        );
    }
}

#[test]
fn pae_to_pae_guest_to_host_entry_lands_where_the_catalog_says() {
    let mut mem = TestMemory::new();
    let mut driver = new_driver(&mut mem);

    driver.select_switcher(SwitcherKind::PaeToPae).unwrap();
    driver
        .relocate(0, &mem, &TestLoader::new(), &TestArch)
        .unwrap();

    let def = switcher::lookup(SwitcherKind::PaeToPae).unwrap();
    assert_eq!(56, def.off_guest_to_host);

    let image = driver.image();
    let expected = image.tri().guest().base()
        + u64::from(image.offset_of(SwitcherKind::PaeToPae).unwrap())
        + 56;
    assert_eq!(expected, driver.active().unwrap().guest_to_host);
}

#[test]
fn host_call_round_trip_through_the_public_surface() {
    let mut mem = TestMemory::new();
    let mut driver = new_driver(&mut mem);
    driver.select_switcher(SwitcherKind::X32ToX32).unwrap();
    driver
        .relocate(0, &mem, &TestLoader::new(), &TestArch)
        .unwrap();

    let mut executor = TestExecutor::new(vec![
        RunExit::CallHost,
        RunExit::Completed(TerminalStatus::Success),
    ]);
    executor.file_host_call(HostCallOp::AcquireLock, 0x42);
    let mut host = TestHost::new();

    let status = driver.run_guest(&mut executor, &mut host).unwrap();
    assert_eq!(TerminalStatus::Success, status);
    assert_eq!(&[("acquire_lock", 0x42)], host.calls());
    assert_eq!(0x42, executor.last_result());
    // entry, then the post-service resume
    assert_eq!(2, executor.transitions());
}

#[test]
fn fatal_assertion_surfaces_and_zeroes_the_resume_target() {
    let mut mem = TestMemory::new();
    let mut driver = new_driver(&mut mem);
    driver.select_switcher(SwitcherKind::Amd64ToPae).unwrap();
    driver
        .relocate(0, &mem, &TestLoader::new(), &TestArch)
        .unwrap();
    assert_eq!(common::RESUME_GUEST_ADDR, driver.resume_guest());

    let mut executor = TestExecutor::new(vec![RunExit::CallHost]);
    executor.file_host_call(HostCallOp::FatalAssertion, 0);
    let mut host = TestHost::new();

    let status = driver.run_guest(&mut executor, &mut host).unwrap();
    assert_eq!(TerminalStatus::HyperAssertion, status);
    assert_eq!(0, driver.resume_guest());
    assert!(host.calls().is_empty());
    assert!(driver.assertion().is_set());
}

#[test]
fn conflicting_identity_mappings_are_retried_and_released() {
    let mut mem = TestMemory::new().with_intermediate_conflicts(3);
    let driver = new_driver(&mut mem);
    // three conflicting allocations plus the one that stuck
    assert_eq!(4, mem.alloc_count());
    assert_eq!(1, mem.live_allocs());

    driver.teardown(&mut mem).unwrap();
    assert_eq!(0, mem.live_allocs());
}

#[test]
fn saved_state_round_trips_the_stack() {
    let mut mem = TestMemory::new();
    let mut driver = new_driver(&mut mem);
    driver.stack_mut().fill();
    driver.stack_mut().push_u32(0x1234_5678).unwrap();

    let mut unit = Vec::new();
    snapshot::save(driver.stack(), &mut unit).unwrap();

    let mut restored = new_driver(&mut mem);
    snapshot::load(restored.stack_mut(), &mut unit.as_slice()).unwrap();
    assert_eq!(driver.stack().bytes(), restored.stack().bytes());
}
