use std::path::PathBuf;

pub mod download;
pub mod pool;
pub mod volume;

/// Locations used on an instance host. Everything that can clash between
/// two stacks sharing a host is placed under a stack specific name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    workdir: PathBuf,
    stack: String,
}

impl StorageLayout {
    const POOLS_DIR: &'static str = "libvirt/pools";
    const ROOTFS_DIR: &'static str = "rootfs";
    const KERNELS_DIR: &'static str = "kernel-packages";
    const KERNEL_IMAGE: &'static str = "bzImage";
    const RAMFS_DIR: &'static str = "kmt-ramfs";

    pub fn new(workdir: PathBuf, stack: String) -> Self {
        Self { workdir, stack }
    }

    pub fn stack(&self) -> &str {
        &self.stack
    }

    pub fn pool_name(&self, vmset: &str, pool_type: &str) -> String {
        format!("{}-{}-{}", self.stack, vmset, pool_type)
    }

    pub fn pool_path(&self, pool_name: &str) -> PathBuf {
        self.workdir.join(Self::POOLS_DIR).join(pool_name)
    }

    pub fn image_dir(&self) -> PathBuf {
        self.workdir.join(Self::ROOTFS_DIR).join(&self.stack)
    }

    pub fn kernel_path(&self, kernel_dir: &str) -> PathBuf {
        self.workdir
            .join(Self::KERNELS_DIR)
            .join(kernel_dir)
            .join(Self::KERNEL_IMAGE)
    }

    pub fn varstore_path(&self, libvirt_name: &str) -> PathBuf {
        self.workdir.join(format!("varstore.{}", libvirt_name))
    }

    pub fn efi_path(&self) -> PathBuf {
        self.workdir.join("efi.fd")
    }

    pub fn ramfs_dir(&self) -> PathBuf {
        self.workdir.join(Self::RAMFS_DIR)
    }

    pub fn microvm_key_path(&self) -> PathBuf {
        self.workdir.join("ddvm_rsa")
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use super::StorageLayout;

    #[test]
    fn paths_are_namespaced_by_stack() {
        let layout = StorageLayout::new(PathBuf::from("/root"), String::from("dev"));
        let pool = layout.pool_name("set-a", "default");
        assert_eq!(pool, "dev-set-a-default");
        assert_eq!(
            layout.pool_path(&pool),
            PathBuf::from("/root/libvirt/pools/dev-set-a-default")
        );
        assert_eq!(layout.image_dir(), PathBuf::from("/root/rootfs/dev"));
        assert_eq!(
            layout.kernel_path("v6.1"),
            PathBuf::from("/root/kernel-packages/v6.1/bzImage")
        );
        assert_eq!(
            layout.varstore_path("dev-ddvm-x"),
            PathBuf::from("/root/varstore.dev-ddvm-x")
        );
    }
}
