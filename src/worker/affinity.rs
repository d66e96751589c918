//! CPU pinning
//!
//! Workers are pinned round-robin over the affinity set so that a run
//! exercises a stable set of cores and the per-CPU usage table stays
//! meaningful. Each worker pins itself right after its thread starts.

use anyhow::Context;

use crate::Result;

/// Pin the calling thread to a single CPU.
pub fn pin_to_cpu(cpu: u32) -> Result<()> {
    if cpu as usize >= libc::CPU_SETSIZE as usize {
        anyhow::bail!("CPU id {cpu} exceeds the maximum supported id");
    }

    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu as usize, &mut set);

        let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("pinning thread to cpu {cpu}"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysinfo::SysInfo;

    #[test]
    fn test_pin_to_first_online_cpu() {
        let sys = SysInfo::probe(None).unwrap();
        let cpu = sys.affinity_cpus[0];

        // pin a scratch thread so the test harness thread stays unpinned
        std::thread::spawn(move || {
            pin_to_cpu(cpu).unwrap();

            unsafe {
                let mut set: libc::cpu_set_t = std::mem::zeroed();
                let ret =
                    libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set);
                assert_eq!(ret, 0);
                assert!(libc::CPU_ISSET(cpu as usize, &set));
                assert_eq!(libc::CPU_COUNT(&set), 1);
            }
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_pin_rejects_out_of_range_cpu() {
        assert!(pin_to_cpu(libc::CPU_SETSIZE as u32 + 1).is_err());
    }
}
