use quickcheck::{quickcheck, TestResult};
use tgraph::memory::device::runtime;
use tgraph::{status, Error, MemType, MemoryManager};

fn written(pattern: &[i32], mem: MemType) -> MemoryManager<i32> {
    let mut m = MemoryManager::new(pattern.len(), mem, 0).unwrap();
    m.copy_from_all(&MemoryManager::from_vec(pattern.to_vec())).unwrap();
    m
}

fn read(m: &MemoryManager<i32>) -> Vec<i32> {
    let mut host = MemoryManager::new(m.size(), MemType::Host, 0).unwrap();
    host.copy_from_all(m).unwrap();
    host.host_slice().unwrap().to_vec()
}

fn round_trip(pattern: &[i32], p1: MemType, p2: MemType) -> Vec<i32> {
    let a = written(pattern, p1);
    let mut b = MemoryManager::new(pattern.len(), p2, 0).unwrap();
    b.copy_from_all(&a).unwrap();
    let mut c = MemoryManager::new(pattern.len(), p1, 0).unwrap();
    c.copy_from_all(&b).unwrap();
    read(&c)
}

#[test]
fn residency_round_trip() {
    for size in [0, 1, 1024] {
        let pattern: Vec<i32> = (0..size as i32).map(|i| i * 7 - 3).collect();
        for p1 in MemType::ALL {
            for p2 in MemType::ALL {
                assert_eq!(round_trip(&pattern, p1, p2), pattern, "{p1} -> {p2}, size {size}");
            }
        }
    }
}

#[test]
fn residency_round_trip_random() {
    fn prop(pattern: Vec<i32>, p1: u8, p2: u8) -> TestResult {
        let p1 = MemType::ALL[p1 as usize % 4];
        let p2 = MemType::ALL[p2 as usize % 4];
        TestResult::from_bool(round_trip(&pattern, p1, p2) == pattern)
    }
    quickcheck(prop as fn(Vec<i32>, u8, u8) -> TestResult);
}

#[test]
fn zeroing() {
    for mem in MemType::ALL {
        let mut m = written(&[5, 6, 7, 8], mem);
        m.zero().unwrap();
        for i in 0..4 {
            assert_eq!(m.get(i).unwrap(), 0, "{mem}");
        }
        assert_eq!(read(&m), vec![0; 4]);
    }
}

#[test]
fn scalar_access_is_bounds_checked() {
    for mem in MemType::ALL {
        let mut m = MemoryManager::<f32>::new(3, mem, 0).unwrap();
        m.set(2, 1.5).unwrap();
        assert_eq!(m.get(2).unwrap(), 1.5);

        let err = m.get(3).unwrap_err();
        assert_eq!(err, Error::IndexOutOfBounds { index: 3, size: 3 });
        assert_ne!(status(&m.set(7, 0.0)), 0);
    }
}

#[test]
fn managed_set_defers_transfer() {
    let mut m = written(&[1, 2, 3], MemType::Managed);
    m.set(0, 42).unwrap();

    // kernels read the device copy, which has not seen the write
    assert_eq!(m.get_ptr(), &[1, 2, 3]);
    assert_eq!(m.get(0).unwrap(), 42);

    m.sync(false).unwrap();
    assert_eq!(m.get_ptr(), &[42, 2, 3]);
}

#[test]
fn partial_copy() {
    let src = written(&[1, 2, 3, 4, 5], MemType::CudaManaged);
    let mut dst = MemoryManager::new(3, MemType::Device, 0).unwrap();
    dst.copy_from(&src, 2, 3).unwrap();
    assert_eq!(read(&dst), vec![3, 4, 5]);

    assert!(matches!(dst.copy_from(&src, 3, 3), Err(Error::Range { .. })));
    assert!(matches!(dst.copy_from(&src, 0, 4), Err(Error::Range { .. })));
}

#[test]
fn buffers_are_released() {
    let dev = runtime().device(0).unwrap();
    for mem in [MemType::Device, MemType::Managed, MemType::CudaManaged] {
        let m = MemoryManager::<f64>::new(128, mem, 0).unwrap();
        let keys = m.device_allocations();
        assert_eq!(keys.len(), 1);
        assert!(dev.is_live(keys[0]));

        let clone = m.try_clone().unwrap();
        assert_ne!(clone.device_allocations(), keys);

        drop(m);
        assert!(!dev.is_live(keys[0]), "{mem}");
        drop(clone);
    }
}

#[test]
fn host_needs_no_device() {
    assert!(MemoryManager::<u8>::new(4, MemType::Host, 99).is_ok());
    assert!(matches!(
        MemoryManager::<u8>::new(4, MemType::Device, 99),
        Err(Error::InvalidDevice { id: 99, .. })
    ));
}
