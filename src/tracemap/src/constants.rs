use static_assertions::const_assert;

/// Default trace map size. Must match what the target's instrumentation was built with.
pub const MAP_SIZE: usize = 1 << 16;

/// Environment variable the instrumentation runtime reads the SysV shm id from
pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";

/// Environment variable that overrides `MAP_SIZE`
pub const MAP_SIZE_ENV_VAR: &str = "AFL_MAP_SIZE";

/// Hardcoded file descriptors the fork server companion talks over
pub const FORKSRV_CTL_FD: i32 = 198;
pub const FORKSRV_ST_FD: i32 = FORKSRV_CTL_FD + 1;

/// Written into the first word of the trace map when the target image could not be loaded
pub const EXEC_FAIL_SIG: u32 = 0xfee1_dead;

/// Exit code MSAN is configured to use when it finds a bug
pub const MSAN_ERROR: i32 = 86;

/// Fork server hello option bits
pub const FS_OPT_ENABLED: u32 = 0x8000_0001;
pub const FS_OPT_MAPSIZE: u32 = 0x4000_0000;
pub const FS_OPT_MAX_MAPSIZE: usize = ((0x00ff_fffe >> 1) + 1) as usize;

const_assert!(MAP_SIZE.is_power_of_two());
const_assert!(MAP_SIZE <= FS_OPT_MAX_MAPSIZE);
const_assert!(std::mem::size_of::<u32>() == 4);

/// Encode map size into the hello word a companion sends on startup
pub fn fs_opt_set_mapsize(size: usize) -> u32 {
    if size <= 1 || size > FS_OPT_MAX_MAPSIZE {
        0
    } else {
        ((size - 1) << 1) as u32
    }
}

/// Decode the map size announced in a hello word
pub fn fs_opt_get_mapsize(hello: u32) -> usize {
    (((hello & 0x00ff_fffe) >> 1) + 1) as usize
}

#[test]
fn test_mapsize_encoding() {
    let hello = FS_OPT_ENABLED | FS_OPT_MAPSIZE | fs_opt_set_mapsize(MAP_SIZE);
    assert_eq!(fs_opt_get_mapsize(hello), MAP_SIZE);
    assert_eq!(fs_opt_get_mapsize(fs_opt_set_mapsize(4096)), 4096);
    assert_eq!(fs_opt_set_mapsize(1), 0);
    assert_eq!(fs_opt_set_mapsize(FS_OPT_MAX_MAPSIZE + 1), 0);
}
