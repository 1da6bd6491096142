mod common;

use common::{CODE_BASE, DATA_BASE, TestKernel, push_user_str, sample_program, syscall, va};
use keos_vm::{
    KernelError,
    addressing::{KERNEL_BASE, PAGE_SIZE, USER_STACK_TOP},
    fs::traits::FileSystem,
    kernel::Pid,
    process::create_initial_process,
    syscall::SyscallNumber,
    task::{PFErrorCode, Task},
};
use std::ops::ControlFlow;

fn ok(flow: ControlFlow<i32, usize>) -> usize {
    match flow {
        ControlFlow::Continue(v) => v,
        ControlFlow::Break(status) => panic!("process terminated with {}", status),
    }
}

fn errno(e: KernelError) -> usize {
    e.into_usize()
}

fn kernel() -> TestKernel {
    let t = TestKernel::new(64, 64);
    t.fs.add("prog", &sample_program());
    t
}

#[test]
fn initial_process_runs_and_exits() {
    let t = kernel();
    let exe = t.fs.inode("prog");
    {
        let exe = exe.clone();
        t.scheduler.install("prog", move |p, regs| {
            assert_eq!(regs.rip, CODE_BASE as usize);
            assert_eq!(regs.rdi, 3, "argc should count every argument");
            let mut argv0 = [0u8; 8];
            p.mm_struct_mut().read_user(va(regs.rsi), &mut argv0).unwrap();
            assert_eq!(
                p.mm_struct_mut()
                    .read_user_str(va(usize::from_ne_bytes(argv0)), 64)
                    .as_deref(),
                Ok("prog"),
                "argv[0] should be the program name"
            );
            assert!(exe.is_write_denied(), "a running executable is write-denied");
            42
        });
    }
    let child = create_initial_process(&t.kernel, "prog  a   b");
    assert_eq!(child.join(), 42);
    assert!(
        t.console.output().ends_with("prog: exit(42)\n"),
        "exit should print the process name and status"
    );
    assert!(!exe.is_write_denied(), "writes are allowed again after exit");
}

#[test]
fn failed_load_exits_with_minus_one() {
    let t = kernel();
    assert_eq!(create_initial_process(&t.kernel, "missing").join(), -1);
    assert!(t.console.output().contains("missing: exit(-1)\n"));

    let t = TestKernel::with(64, 64, |builder| builder.max_args(2));
    t.fs.add("prog", &sample_program());
    assert_eq!(
        create_initial_process(&t.kernel, "prog a b").join(),
        -1,
        "too many arguments should fail the load"
    );
    t.fs.add("junk", b"not an executable at all");
    assert_eq!(create_initial_process(&t.kernel, "junk").join(), -1);
}

#[test]
fn fork_and_wait() {
    let t = kernel();
    t.scheduler.install("prog", |p, regs| {
        let name = push_user_str(p, regs, "child");
        let pid = ok(syscall(p, regs, SyscallNumber::Fork, &[name]));
        assert_ne!(pid, 0, "the parent gets the child's pid");
        assert_ne!(pid, p.pid().into_usize());

        assert_eq!(ok(syscall(p, regs, SyscallNumber::Wait, &[pid])), 7);
        assert_eq!(
            ok(syscall(p, regs, SyscallNumber::Wait, &[pid])),
            errno(KernelError::NoChild),
            "a child can be waited for only once"
        );
        assert_eq!(p.wait(Pid(12345)), Err(KernelError::NoChild));
        0
    });
    t.scheduler.install("child", |p, regs| {
        assert_eq!(regs.rax, 0, "the child sees fork() return 0");
        assert_eq!(p.name(), "child");
        7
    });
    assert_eq!(create_initial_process(&t.kernel, "prog").join(), 0);
    let output = t.console.output();
    assert!(output.contains("child: exit(7)\n"));
    assert!(output.ends_with("prog: exit(0)\n"));
}

#[test]
fn failed_fork_leaves_no_child() {
    // Four frames and no swap: the parent keeps three resident anonymous
    // pages, so the child runs out of memory while copying them.
    let t = TestKernel::new(4, 0);
    t.fs.add("prog", &sample_program());
    t.scheduler.install("prog", |p, regs| {
        let frames = p.kernel().frames().clone();
        p.mm_struct_mut()
            .write_user(va(DATA_BASE as usize), b"parent")
            .unwrap();
        p.mm_struct_mut()
            .write_user(va(DATA_BASE as usize + PAGE_SIZE), b"more")
            .unwrap();
        let used = frames.used();
        assert_eq!(used, 3);

        let name = push_user_str(p, regs, "child");
        let result = ok(syscall(p, regs, SyscallNumber::Fork, &[name]));
        assert!((result as isize) < 0, "fork() should report the failure");
        assert_eq!(result, errno(KernelError::NoMemory));
        assert_eq!(
            frames.used(),
            used,
            "the half-built child should release its frames"
        );
        // The failed child took the pid after ours.
        let child = p.pid().into_usize() + 1;
        assert_eq!(
            ok(syscall(p, regs, SyscallNumber::Wait, &[child])),
            errno(KernelError::NoChild),
            "a child that was never built cannot be waited for"
        );

        let mut buf = [0u8; 6];
        p.mm_struct_mut()
            .read_user(va(DATA_BASE as usize), &mut buf)
            .unwrap();
        assert_eq!(&buf, b"parent", "the parent is untouched");
        0
    });
    t.scheduler.install("child", |_, _| panic!("the child should not run"));
    assert_eq!(create_initial_process(&t.kernel, "prog").join(), 0);
    assert_eq!(t.console.output(), "prog: exit(0)\n");
}

#[test]
fn negative_status_through_wait() {
    let t = kernel();
    t.scheduler.install("prog", |p, regs| {
        let name = push_user_str(p, regs, "child");
        let pid = ok(syscall(p, regs, SyscallNumber::Fork, &[name]));
        ok(syscall(p, regs, SyscallNumber::Wait, &[pid])) as isize as i32
    });
    t.scheduler.install("child", |p, regs| {
        match syscall(p, regs, SyscallNumber::Write, &[1, 0x10, 4]) {
            ControlFlow::Break(status) => status,
            ControlFlow::Continue(_) => 0,
        }
    });
    assert_eq!(
        create_initial_process(&t.kernel, "prog").join(),
        -1,
        "a child killed by the kernel exits with -1"
    );
}

#[test]
fn parent_exit_releases_children() {
    let t = kernel();
    t.scheduler.install("prog", |p, regs| {
        let name = push_user_str(p, regs, "child");
        ok(syscall(p, regs, SyscallNumber::Fork, &[name]));
        1
    });
    t.scheduler.install("child", |_, _| 2);
    assert_eq!(create_initial_process(&t.kernel, "prog").join(), 1);
}

#[test]
fn fork_copies_memory() {
    let t = kernel();
    let shared = t.fs.add("shared", &[b'_'; PAGE_SIZE]);
    const MAP: usize = 0x1000_0000;
    let data = va(DATA_BASE as usize);
    {
        let shared = shared.clone();
        t.scheduler.install("prog", move |p, regs| {
            p.mm_struct_mut().write_user(data, b"parent").unwrap();
            let path = push_user_str(p, regs, "shared");
            let fd = ok(syscall(p, regs, SyscallNumber::Open, &[path]));
            assert_eq!(
                ok(syscall(p, regs, SyscallNumber::Mmap, &[MAP, PAGE_SIZE, 1, fd, 0])),
                MAP
            );
            p.mm_struct_mut().write_user(va(MAP), b"parent-map").unwrap();

            let name = push_user_str(p, regs, "child");
            let pid = ok(syscall(p, regs, SyscallNumber::Fork, &[name]));
            assert_eq!(ok(syscall(p, regs, SyscallNumber::Wait, &[pid])), 0);

            let mut buf = [0u8; 10];
            p.mm_struct_mut().read_user(data, &mut buf[..6]).unwrap();
            assert_eq!(&buf[..6], b"parent", "the child must not change our memory");
            p.mm_struct_mut().read_user(va(MAP), &mut buf).unwrap();
            assert_eq!(&buf, b"parent-map", "the child must not change our mapping");
            assert_eq!(
                &shared.contents()[..10],
                b"child-map!",
                "the child's mapping is written back when it exits"
            );
            0
        });
    }
    t.scheduler.install("child", move |p, _| {
        let mut buf = [0u8; 10];
        p.mm_struct_mut().read_user(data, &mut buf[..6]).unwrap();
        if &buf[..6] != b"parent" {
            return 1;
        }
        p.mm_struct_mut().read_user(va(MAP), &mut buf).unwrap();
        if &buf != b"parent-map" {
            return 2;
        }
        p.mm_struct_mut().write_user(data, b"child!").unwrap();
        p.mm_struct_mut().write_user(va(MAP), b"child-map!").unwrap();
        0
    });
    assert_eq!(create_initial_process(&t.kernel, "prog").join(), 0);
    assert_eq!(
        &shared.contents()[..10],
        b"parent-map",
        "the parent's mapping is written back when it exits"
    );
}

#[test]
fn fork_copies_swapped_pages() {
    let t = TestKernel::new(12, 64);
    t.fs.add("prog", &sample_program());
    const PAGES: usize = 16;
    let base = USER_STACK_TOP - 2 * PAGE_SIZE - PAGES * PAGE_SIZE;
    t.scheduler.install("prog", move |p, regs| {
        p.mm_struct_mut().record_stack_pointer(va(base));
        for i in 0..PAGES {
            p.mm_struct_mut()
                .write_user(va(base + i * PAGE_SIZE + 8), &[i as u8 + 1; 8])
                .unwrap();
        }
        let name = push_user_str(p, regs, "child");
        let pid = ok(syscall(p, regs, SyscallNumber::Fork, &[name]));
        ok(syscall(p, regs, SyscallNumber::Wait, &[pid])) as i32
    });
    t.scheduler.install("child", move |p, _| {
        for i in 0..PAGES {
            let mut buf = [0u8; 8];
            p.mm_struct_mut()
                .read_user(va(base + i * PAGE_SIZE + 8), &mut buf)
                .unwrap();
            if buf != [i as u8 + 1; 8] {
                return 100 + i as i32;
            }
        }
        0
    });
    assert_eq!(
        create_initial_process(&t.kernel, "prog").join(),
        0,
        "pages evicted before fork should be copied into the child"
    );
    assert_eq!(t.kernel.frames().used(), 0);
    assert_eq!(t.kernel.frames().swap().in_use(), 0);
}

#[test]
fn fork_duplicates_descriptors() {
    let t = kernel();
    t.fs.add("notes", b"0123456789");
    t.scheduler.install("prog", |p, regs| {
        let path = push_user_str(p, regs, "notes");
        let fd = ok(syscall(p, regs, SyscallNumber::Open, &[path]));
        assert_eq!(fd, 2, "the lowest free descriptor is used");
        let buf = regs.rsp - 0x200;
        assert_eq!(ok(syscall(p, regs, SyscallNumber::Read, &[fd, buf, 3])), 3);
        assert_eq!(ok(syscall(p, regs, SyscallNumber::Dup2, &[fd, 5])), 5);

        let name = push_user_str(p, regs, "child");
        let pid = ok(syscall(p, regs, SyscallNumber::Fork, &[name]));
        assert_eq!(ok(syscall(p, regs, SyscallNumber::Wait, &[pid])), 0);

        assert_eq!(
            ok(syscall(p, regs, SyscallNumber::Tell, &[2])),
            3,
            "reads in the child must not move our position"
        );
        assert_eq!(ok(syscall(p, regs, SyscallNumber::Tell, &[5])), 3);
        0
    });
    t.scheduler.install("child", |p, regs| {
        if ok(syscall(p, regs, SyscallNumber::Tell, &[5])) != 3 {
            return 1;
        }
        let buf = regs.rsp - 0x200;
        if ok(syscall(p, regs, SyscallNumber::Read, &[5, buf, 4])) != 4 {
            return 2;
        }
        let mut bytes = [0u8; 4];
        p.mm_struct_mut().read_user(va(buf), &mut bytes).unwrap();
        if &bytes != b"3456" {
            return 3;
        }
        if ok(syscall(p, regs, SyscallNumber::Tell, &[2])) != 7 {
            return 4;
        }
        0
    });
    assert_eq!(create_initial_process(&t.kernel, "prog").join(), 0);
}

#[test]
fn descriptor_calls() {
    let t = TestKernel::with(64, 64, |builder| builder.max_open_files(4));
    t.fs.add("prog", &sample_program());
    t.fs.add("a", b"abc");
    t.scheduler.install("prog", |p, regs| {
        let path = push_user_str(p, regs, "a");
        assert_eq!(ok(syscall(p, regs, SyscallNumber::Open, &[path])), 2);
        assert_eq!(ok(syscall(p, regs, SyscallNumber::Open, &[path])), 3);
        assert_eq!(
            ok(syscall(p, regs, SyscallNumber::Open, &[path])),
            errno(KernelError::TooManyOpenFile)
        );
        let missing = push_user_str(p, regs, "nope");
        assert_eq!(
            ok(syscall(p, regs, SyscallNumber::Open, &[missing])),
            errno(KernelError::NoSuchEntry)
        );
        assert_eq!(ok(syscall(p, regs, SyscallNumber::FileSize, &[2])), 3);
        assert_eq!(ok(syscall(p, regs, SyscallNumber::Seek, &[2, 10])), 0);
        assert_eq!(ok(syscall(p, regs, SyscallNumber::Tell, &[2])), 10);
        let buf = regs.rsp - 0x200;
        assert_eq!(
            ok(syscall(p, regs, SyscallNumber::Read, &[2, buf, 4])),
            0,
            "reading past the end reads nothing"
        );
        assert_eq!(ok(syscall(p, regs, SyscallNumber::Close, &[3])), 0);
        assert_eq!(
            ok(syscall(p, regs, SyscallNumber::Close, &[3])),
            errno(KernelError::BadFileDescriptor)
        );
        assert_eq!(
            ok(syscall(p, regs, SyscallNumber::FileSize, &[1])),
            errno(KernelError::BadFileDescriptor),
            "the console has no size"
        );
        assert_eq!(
            ok(syscall(p, regs, SyscallNumber::Dup2, &[2, 4])),
            errno(KernelError::BadFileDescriptor),
            "dup2() beyond the table should fail"
        );
        assert_eq!(ok(syscall(p, regs, SyscallNumber::Dup2, &[2, 2])), 2);
        0
    });
    assert_eq!(create_initial_process(&t.kernel, "prog").join(), 0);
}

#[test]
fn create_and_remove() {
    let t = kernel();
    t.scheduler.install("prog", |p, regs| {
        let path = push_user_str(p, regs, "new");
        assert_eq!(ok(syscall(p, regs, SyscallNumber::Create, &[path, 10])), 1);
        assert_eq!(
            ok(syscall(p, regs, SyscallNumber::Create, &[path, 0])),
            0,
            "create() over an existing file should fail"
        );
        let empty = push_user_str(p, regs, "");
        assert_eq!(ok(syscall(p, regs, SyscallNumber::Create, &[empty, 0])), 0);

        let fd = ok(syscall(p, regs, SyscallNumber::Open, &[path]));
        assert_eq!(ok(syscall(p, regs, SyscallNumber::FileSize, &[fd])), 10);
        assert_eq!(ok(syscall(p, regs, SyscallNumber::Remove, &[path])), 1);
        assert_eq!(
            ok(syscall(p, regs, SyscallNumber::Remove, &[path])),
            0,
            "a file can be removed only once"
        );
        assert_eq!(
            ok(syscall(p, regs, SyscallNumber::Open, &[path])),
            errno(KernelError::NoSuchEntry)
        );
        let buf = regs.rsp - 0x200;
        assert_eq!(
            ok(syscall(p, regs, SyscallNumber::Read, &[fd, buf, 16])),
            10,
            "an open file outlives its removal"
        );

        match syscall(p, regs, SyscallNumber::Create, &[0x10, 0]) {
            ControlFlow::Break(status) => status,
            ControlFlow::Continue(v) => panic!("create() with a bad path returned {}", v),
        }
    });
    assert_eq!(create_initial_process(&t.kernel, "prog").join(), -1);
    assert!(t.fs.open("new").is_err());
}

#[test]
fn halt_shuts_down() {
    let t = kernel();
    t.scheduler.install("prog", |p, regs| {
        match syscall(p, regs, SyscallNumber::Halt, &[]) {
            ControlFlow::Break(status) => status,
            ControlFlow::Continue(_) => panic!("halt() returned"),
        }
    });
    assert_eq!(create_initial_process(&t.kernel, "prog").join(), 0);
    assert!(t.scheduler.halted());
}

#[test]
fn oversized_descriptors_are_rejected() {
    let t = kernel();
    t.fs.add("a", b"abc");
    t.scheduler.install("prog", |p, regs| {
        let path = push_user_str(p, regs, "a");
        assert_eq!(ok(syscall(p, regs, SyscallNumber::Open, &[path])), 2);
        let wide = (1usize << 32) | 2;
        assert_eq!(
            ok(syscall(p, regs, SyscallNumber::FileSize, &[wide])),
            errno(KernelError::BadFileDescriptor),
            "descriptors must not be truncated"
        );
        assert_eq!(
            ok(syscall(p, regs, SyscallNumber::Close, &[wide])),
            errno(KernelError::BadFileDescriptor)
        );
        assert_eq!(
            ok(syscall(p, regs, SyscallNumber::Dup2, &[2, wide])),
            errno(KernelError::BadFileDescriptor)
        );
        assert_eq!(ok(syscall(p, regs, SyscallNumber::FileSize, &[2])), 3);
        0
    });
    assert_eq!(create_initial_process(&t.kernel, "prog").join(), 0);
}

#[test]
fn console_io_grows_stack() {
    let t = kernel();
    t.console.feed(b"hello console");
    t.scheduler.install("prog", |p, regs| {
        regs.rsp = USER_STACK_TOP - 3 * PAGE_SIZE;
        let buf = regs.rsp + 0x10;
        assert!(p.mm_struct().spt().find(va(buf)).is_none());
        let n = ok(syscall(p, regs, SyscallNumber::Read, &[0, buf, 64]));
        assert_eq!(n, 13);
        assert!(
            p.mm_struct().spt().find(va(buf)).is_some(),
            "a system call touching the stack should grow it"
        );
        assert_eq!(ok(syscall(p, regs, SyscallNumber::Write, &[1, buf, n])), 13);
        assert_eq!(
            ok(syscall(p, regs, SyscallNumber::Write, &[0, buf, n])),
            errno(KernelError::BadFileDescriptor)
        );
        0
    });
    assert_eq!(create_initial_process(&t.kernel, "prog").join(), 0);
    assert_eq!(t.console.output(), "hello consoleprog: exit(0)\n");
}

#[test]
fn bad_pointers_kill() {
    for args in [[1, 0x10, 4], [1, KERNEL_BASE, 4], [1, CODE_BASE as usize, 0]] {
        let t = kernel();
        t.scheduler.install("prog", move |p, regs| {
            match syscall(p, regs, SyscallNumber::Write, &args) {
                ControlFlow::Break(status) => status,
                ControlFlow::Continue(_) => 0,
            }
        });
        let expected = if args[2] == 0 { 0 } else { -1 };
        assert_eq!(create_initial_process(&t.kernel, "prog").join(), expected);
    }

    let t = kernel();
    t.scheduler.install("prog", |p, regs| {
        let text = CODE_BASE as usize;
        match syscall(p, regs, SyscallNumber::Read, &[0, text, 4]) {
            ControlFlow::Break(status) => status,
            ControlFlow::Continue(_) => 0,
        }
    });
    t.console.feed(b"data");
    assert_eq!(
        create_initial_process(&t.kernel, "prog").join(),
        -1,
        "reading into a read-only page should kill the process"
    );

    let t = kernel();
    t.scheduler.install("prog", |p, regs| {
        match syscall(p, regs, SyscallNumber::Open, &[0]) {
            ControlFlow::Break(status) => status,
            ControlFlow::Continue(_) => 0,
        }
    });
    assert_eq!(create_initial_process(&t.kernel, "prog").join(), -1);
}

#[test]
fn unknown_syscall() {
    let t = kernel();
    t.scheduler.install("prog", |p, regs| {
        regs.rax = 99;
        assert_eq!(Task::syscall(p, regs), ControlFlow::Continue(()));
        assert_eq!(regs.rax, errno(KernelError::NoSuchSyscall));
        0
    });
    assert_eq!(create_initial_process(&t.kernel, "prog").join(), 0);
}

#[test]
fn exec_replaces_image() {
    let t = kernel();
    let other = t.fs.add("other", &sample_program());
    let prog = t.fs.inode("prog");
    t.scheduler.install("prog", move |p, regs| {
        p.mm_struct_mut().write_user(va(DATA_BASE as usize), b"old").unwrap();
        let cmd = push_user_str(p, regs, "other one two");
        if let ControlFlow::Break(status) = syscall(p, regs, SyscallNumber::Exec, &[cmd]) {
            return 100 + status;
        }
        assert_eq!(p.name(), "other");
        assert_eq!(regs.rip, CODE_BASE as usize);
        assert_eq!(regs.rdi, 3);
        // "other\0one\0two\0" is 14 bytes, padded to 16.
        assert_eq!(regs.rsp, USER_STACK_TOP - 16 - 8 * 5);
        assert!(other.is_write_denied());
        assert!(!prog.is_write_denied(), "the old executable is released");
        let mut buf = [0u8; 3];
        p.mm_struct_mut()
            .read_user(va(DATA_BASE as usize), &mut buf)
            .unwrap();
        assert_eq!(&buf, b"ini", "the new image starts fresh");
        5
    });
    assert_eq!(create_initial_process(&t.kernel, "prog").join(), 5);
    assert!(t.console.output().ends_with("other: exit(5)\n"));
    assert!(t.mmu.created().iter().all(|pt| pt.is_destroyed()));
    assert!(
        t.mmu.created().iter().any(|pt| pt.activations() == 1),
        "exec should activate the new page table"
    );
}

#[test]
fn failed_exec_kills() {
    let t = kernel();
    t.scheduler.install("prog", |p, regs| {
        let cmd = push_user_str(p, regs, "missing arg");
        match syscall(p, regs, SyscallNumber::Exec, &[cmd]) {
            ControlFlow::Break(status) => status,
            ControlFlow::Continue(_) => 0,
        }
    });
    assert_eq!(create_initial_process(&t.kernel, "prog").join(), -1);
    assert!(t.console.output().ends_with("prog: exit(-1)\n"));
}

#[test]
fn running_executable_is_not_writable() {
    let t = kernel();
    let before = t.fs.inode("prog").contents();
    t.scheduler.install("prog", |p, regs| {
        let path = push_user_str(p, regs, "prog");
        let fd = ok(syscall(p, regs, SyscallNumber::Open, &[path]));
        let buf = regs.rsp;
        assert_eq!(
            ok(syscall(p, regs, SyscallNumber::Write, &[fd, buf, 8])),
            0,
            "writes to a running executable write nothing"
        );
        0
    });
    assert_eq!(create_initial_process(&t.kernel, "prog").join(), 0);
    assert_eq!(t.fs.inode("prog").contents(), before);
}

#[test]
fn mmap_syscalls() {
    let t = kernel();
    let file = t.fs.add("file", b"mapped contents");
    const MAP: usize = 0x2000_0000;
    {
        let file = file.clone();
        t.scheduler.install("prog", move |p, regs| {
            let path = push_user_str(p, regs, "file");
            let fd = ok(syscall(p, regs, SyscallNumber::Open, &[path]));
            assert_eq!(
                ok(syscall(p, regs, SyscallNumber::Mmap, &[0, PAGE_SIZE, 1, fd, 0])),
                0,
                "mmap() reports failure as a null address"
            );
            assert_eq!(
                ok(syscall(p, regs, SyscallNumber::Mmap, &[MAP, PAGE_SIZE, 1, 1, 0])),
                0,
                "the console cannot be mapped"
            );
            assert_eq!(
                ok(syscall(p, regs, SyscallNumber::Mmap, &[MAP, PAGE_SIZE, 1, fd, 0])),
                MAP
            );
            assert_eq!(ok(syscall(p, regs, SyscallNumber::Close, &[fd])), 0);

            let mut buf = [0u8; 6];
            p.mm_struct_mut().read_user(va(MAP), &mut buf).unwrap();
            assert_eq!(&buf, b"mapped");
            p.mm_struct_mut().write_user(va(MAP), b"MAPPED").unwrap();

            assert_eq!(ok(syscall(p, regs, SyscallNumber::Munmap, &[MAP])), 0);
            assert_eq!(&file.contents()[..6], b"MAPPED");
            assert_eq!(
                Task::page_fault(p, PFErrorCode::USER, va(MAP), va(regs.rsp)),
                ControlFlow::Break(-1),
                "access to an unmapped region is fatal"
            );
            0
        });
    }
    assert_eq!(create_initial_process(&t.kernel, "prog").join(), 0);
}

#[test]
fn user_page_faults() {
    let t = kernel();
    t.scheduler.install("prog", |p, regs| {
        let rsp = va(regs.rsp - PAGE_SIZE);
        let write = PFErrorCode::USER | PFErrorCode::WRITE_ACCESS;
        assert_eq!(
            Task::page_fault(p, write, rsp - 8, rsp),
            ControlFlow::Continue(()),
            "push below rsp should grow the stack"
        );
        assert_eq!(
            Task::page_fault(p, PFErrorCode::USER, va(CODE_BASE as usize), rsp),
            ControlFlow::Continue(()),
            "first access to the text segment loads it"
        );
        assert_eq!(
            Task::page_fault(
                p,
                write | PFErrorCode::PRESENT,
                va(CODE_BASE as usize),
                rsp
            ),
            ControlFlow::Break(-1),
            "writing to the text segment is fatal"
        );
        0
    });
    assert_eq!(create_initial_process(&t.kernel, "prog").join(), 0);
}

#[test]
fn resources_are_released() {
    let t = TestKernel::new(16, 64);
    t.fs.add("prog", &sample_program());
    t.fs.add("file", &[1; 3 * PAGE_SIZE]);
    t.scheduler.install("prog", |p, regs| {
        let path = push_user_str(p, regs, "file");
        let fd = ok(syscall(p, regs, SyscallNumber::Open, &[path]));
        ok(syscall(p, regs, SyscallNumber::Mmap, &[0x1000_0000, 3 * PAGE_SIZE, 1, fd, 0]));
        let mut buf = vec![0u8; 3 * PAGE_SIZE];
        p.mm_struct_mut().read_user(va(0x1000_0000), &mut buf).unwrap();
        p.mm_struct_mut().read_user(va(CODE_BASE as usize), &mut buf[..0x1800]).unwrap();
        let name = push_user_str(p, regs, "child");
        let pid = ok(syscall(p, regs, SyscallNumber::Fork, &[name]));
        ok(syscall(p, regs, SyscallNumber::Wait, &[pid])) as i32
    });
    t.scheduler.install("child", |p, _| {
        let mut buf = vec![0u8; 3 * PAGE_SIZE];
        p.mm_struct_mut().read_user(va(0x1000_0000), &mut buf).unwrap();
        i32::from(buf.iter().any(|b| *b != 1))
    });
    assert_eq!(create_initial_process(&t.kernel, "prog").join(), 0);
    assert_eq!(t.kernel.frames().used(), 0, "every frame should be released");
    assert_eq!(t.kernel.frames().swap().in_use(), 0, "every swap slot should be released");
    assert!(
        t.mmu.created().iter().all(|pt| pt.is_destroyed()),
        "every page table should be destroyed"
    );
}
