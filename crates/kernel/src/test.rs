use core::any::type_name;

use crate::{arch::power::shutdown, info, kmain};

#[macro_export]
macro_rules! test_log {
    ($($arg:tt)*) => {
        $crate::logln_ext!("test", "92", $($arg)*)
    };
}

macro_rules! ok {
    ($last_time_us: expr) => {{
        let end_time_us = $crate::time!(us);
        let delta_time_us = end_time_us - $last_time_us;
        let delta_time_ms = delta_time_us / 1000;
        $crate::logln!(
            "[ \x1B[92m OK   \x1B[0m  ]\x1b[90m:\x1B[0m delta {}ms ({}us)",
            delta_time_ms,
            delta_time_us
        );
    }};
}

pub trait Testable {
    fn run(&self);
    #[inline(always)]
    fn name(&self) -> &'static str {
        type_name::<Self>()
    }
    #[inline(always)]
    fn priority(&self) -> TestPriority {
        get_test_priority::<Self>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Represents the priority of a test.
pub enum TestPriority {
    // crate::arch tests must be ran before other tests to ensure fail order
    Highest,
    // memory tests
    High,
    Medium,
    // tests that run last, given to this module tests
    Lowest,
}

const fn get_test_priority<T: ?Sized>() -> TestPriority {
    const {
        let name = type_name::<T>();
        if const_str::contains!(name, "test::") {
            TestPriority::Lowest
        } else if const_str::contains!(name, "arch::") {
            TestPriority::Highest
        } else if const_str::contains!(name, "memory::") {
            TestPriority::High
        } else {
            TestPriority::Medium
        }
    }
}

impl<T: Fn()> Testable for T {
    fn run(&self) {
        self();
    }
}

pub fn test_runner(tests: &[&dyn Testable]) -> ! {
    test_log!("waiting for the secondary cpus to settle...");
    kmain::wait_ms(500);

    let tests_iter = tests
        .iter()
        .filter(|test| test.priority() == TestPriority::Highest);
    let tests_iter =
        tests_iter.chain(tests.iter().filter(|test| test.priority() == TestPriority::High));
    let tests_iter = tests_iter.chain(
        tests
            .iter()
            .filter(|test| test.priority() == TestPriority::Medium),
    );
    let tests_iter = tests_iter.chain(
        tests
            .iter()
            .filter(|test| test.priority() == TestPriority::Lowest),
    );

    test_log!("running {} tests", tests.len());
    let first_log_ms = crate::time!(ms);

    for test in tests_iter {
        unsafe {
            crate::arch::disable_interrupts();
        }
        test_log!("running test \x1B[90m{}\x1B[0m...", test.name());
        let last_log = crate::time!(us);
        test.run();
        ok!(last_log);
        unsafe {
            crate::arch::enable_interrupts();
        }
    }
    info!(
        "finished running tests in {}ms",
        crate::time!(ms) - first_log_ms
    );

    // printing 'PLEASE EXIT' to the serial lets the runner know the kernel
    // tests were successful
    info!("PLEASE EXIT, automatically attempting exiting after 1000ms, PLEASE EXIT");
    kmain::wait_ms(1000);
    shutdown()
}

// the end-to-end exercises that need several subsystems at once live here,
// which also makes them run last

#[test_case]
fn reply_right_round_trip() {
    use crate::ipc::{Port, Right, RightType, rights};
    use crate::task::group::TaskGroup;
    use portal_abi::errors::ErrorStatus;

    let client_group = TaskGroup::create();
    let server_group = TaskGroup::create();
    let service = Port::create_for_kernel();
    let reply_to = Port::create_for_kernel();

    let (send_right, _) =
        Right::create_for_group(&service, &client_group, RightType::SendMany, 1).unwrap();

    // client sends, asking for a reply right
    rights::send_message_right(
        &send_right,
        &client_group,
        b"ping".to_vec(),
        &[],
        Some(&reply_to),
        1,
    )
    .unwrap();

    // server receives and answers through the reply right
    let mut request = service.pop_message().unwrap();
    assert_eq!(request.payload, b"ping");
    let reply_right = request.reply_right.take().unwrap();
    let reply_id = reply_right.attach_to_group(&server_group);
    assert!(reply_id != 0);

    rights::send_message_right(&reply_right, &server_group, b"pong".to_vec(), &[], None, 2)
        .unwrap();

    // the reply arrived in FIFO order with the exact bytes, and the
    // send-once right died with its one use
    let answer = reply_to.pop_message().unwrap();
    assert_eq!(answer.payload, b"pong");
    assert!(!reply_right.is_alive());
    assert_eq!(
        rights::send_message_right(&reply_right, &server_group, b"again".to_vec(), &[], None, 2),
        Err(ErrorStatus::RightDead)
    );

    send_right.destroy(Some(&client_group)).unwrap();
    service.destroy();
    reply_to.destroy();
    client_group.destroy();
    server_group.destroy();
}

#[test_case]
fn cow_clone_shares_until_write() {
    use crate::VirtAddr;
    use crate::memory::address_space::AddressSpace;
    use crate::memory::paging::PAGE_SIZE;
    use crate::memory::regions::{AccessFlags, FaultResolution, RegionPolicy};

    let parent = AddressSpace::create().unwrap();
    let start = parent
        .add_region(
            VirtAddr::from(0x6000_0000),
            PAGE_SIZE,
            AccessFlags::READ | AccessFlags::WRITE,
            RegionPolicy::AnonymousLazy,
        )
        .unwrap();

    // materialize and fill the page in the parent
    assert!(matches!(
        parent.resolve_fault(start, AccessFlags::WRITE),
        FaultResolution::Resolved
    ));
    parent.copy_to_user(start, b"original").unwrap();

    let child = parent.clone_space().unwrap();

    // both sides read the same frame
    assert_eq!(parent.resolve_phys(start), child.resolve_phys(start));
    assert_eq!(&child.copy_from_user(start, 8).unwrap(), b"original");

    // a write in the child splits the sharing
    assert!(matches!(
        child.resolve_fault(start, AccessFlags::WRITE),
        FaultResolution::Resolved
    ));
    child.copy_to_user(start, b"mutated!").unwrap();

    assert_ne!(parent.resolve_phys(start), child.resolve_phys(start));
    assert_eq!(&parent.copy_from_user(start, 8).unwrap(), b"original");
    assert_eq!(&child.copy_from_user(start, 8).unwrap(), b"mutated!");
}
