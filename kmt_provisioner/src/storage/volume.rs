use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
};

use log::{debug, info};
use serde::Serialize;
use thiserror::Error;

use super::{download::ImageSource, StorageLayout};
use crate::config::{VmSet, DEFAULT_POOL};
use crate::engine::{ResourceArgs, ResourceEngine, ResourceHandle, ResourceKind};
use crate::runner::{CommandArgs, CommandRunner, RunnerError};
use crate::virtualization::templates::{self, render, TemplateArgs, Templates};

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum VolumeError {
    #[error("Invalid image source {uri}: {message}")]
    InvalidSource { uri: String, message: String },
    #[error("Vm set {vmset} has an invalid recipe: {message}")]
    Recipe { vmset: String, message: String },
    #[error("Volume {name} in pool {pool} is backed by more than one image")]
    DuplicateVolumeName { pool: String, name: String },
    #[error("Failed to set up volume {volume}: {message}")]
    Setup { volume: String, message: String },
    #[error("Failed to download images: {0}")]
    Download(String),
}

pub const ROOT_MOUNT_POINT: &str = "/";
pub const VOLUME_FORMAT: &str = "qcow2";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilesystemImage {
    pub image_name: String,
    pub image_path: PathBuf,
    pub source: ImageSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LibvirtVolume {
    pub image: FilesystemImage,
    pub pool: String,
    pub key: String,
}

impl LibvirtVolume {
    pub fn resource_name(&self) -> String {
        format!("{}-{}", self.pool, self.image.image_name)
    }

    pub fn scratch_path(&self) -> String {
        format!("/tmp/volume-{}.xml", self.resource_name())
    }

    pub fn xml(&self) -> String {
        let args = TemplateArgs::from([
            (templates::IMAGE_NAME, self.image.image_name.clone()),
            (templates::VOLUME_KEY, self.key.clone()),
            (templates::FORMAT, VOLUME_FORMAT.to_string()),
        ]);
        render(Templates::defaults().volume, &args)
    }
}

/// A base volume used by a domain, mounted at `mount_point` after boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeAttachment {
    pub volume_key: String,
    pub pool: String,
    pub mount_point: String,
}

impl VolumeAttachment {
    pub fn is_root(&self) -> bool {
        self.mount_point == ROOT_MOUNT_POINT
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VolumePlan {
    pub volumes: Vec<LibvirtVolume>,
    /// Attachments per vm set and kernel tag, root volume first.
    pub attachments: BTreeMap<String, BTreeMap<String, Vec<VolumeAttachment>>>,
}

impl VolumePlan {
    pub fn attachments_for(&self, vmset: &str, kernel_tag: &str) -> Option<&[VolumeAttachment]> {
        self.attachments
            .get(vmset)?
            .get(kernel_tag)
            .map(Vec::as_slice)
    }

    pub fn images(&self) -> impl Iterator<Item = &FilesystemImage> {
        self.volumes.iter().map(|volume| &volume.image)
    }
}

pub struct VolumeManager {
    layout: StorageLayout,
}

struct Planner<'a> {
    layout: &'a StorageLayout,
    plan: VolumePlan,
    by_image: HashMap<(String, PathBuf), usize>,
    names: HashMap<(String, String), PathBuf>,
}

impl Planner<'_> {
    /// Images fetched from the web land in the stack image directory. Local
    /// files are used where they are.
    fn image(&self, source: &str, name: Option<&str>) -> Result<FilesystemImage, VolumeError> {
        let source = ImageSource::parse(source)?;
        let image_name = match name {
            Some(name) => PathBuf::from(name)
                .file_name()
                .map(|name| name.to_string_lossy().to_string()),
            None => source.file_name(),
        }
        .ok_or_else(|| VolumeError::InvalidSource {
            uri: format!("{:?}", source),
            message: String::from("image has no file name"),
        })?;
        let image_path = match &source {
            ImageSource::File(path) => path.clone(),
            ImageSource::Web(_) => self.layout.image_dir().join(&image_name),
        };
        Ok(FilesystemImage {
            image_name,
            image_path,
            source,
        })
    }

    fn volume(
        &mut self,
        vmset: &str,
        pool_type: &str,
        image: FilesystemImage,
    ) -> Result<(String, String), VolumeError> {
        let dedup_key = (pool_type.to_string(), image.image_path.clone());
        if let Some(index) = self.by_image.get(&dedup_key) {
            let volume = &self.plan.volumes[*index];
            debug!("Reusing volume {} for vm set {}", volume.key, vmset);
            return Ok((volume.key.clone(), volume.pool.clone()));
        }

        let pool = self.layout.pool_name(vmset, pool_type);
        match self
            .names
            .get(&(pool.clone(), image.image_name.clone()))
        {
            Some(path) if *path != image.image_path => {
                return Err(VolumeError::DuplicateVolumeName {
                    pool,
                    name: image.image_name,
                })
            }
            _ => {}
        }
        let key = self
            .layout
            .pool_path(&pool)
            .join(&image.image_name)
            .to_string_lossy()
            .to_string();
        self.names.insert(
            (pool.clone(), image.image_name.clone()),
            image.image_path.clone(),
        );
        self.by_image.insert(dedup_key, self.plan.volumes.len());
        self.plan.volumes.push(LibvirtVolume {
            image,
            pool: pool.clone(),
            key: key.clone(),
        });
        Ok((key, pool))
    }

    fn attach(&mut self, vmset: &VmSet) -> Result<(), VolumeError> {
        let recipe = vmset.recipe().map_err(|err| VolumeError::Recipe {
            vmset: vmset.name.clone(),
            message: err.to_string(),
        })?;

        for kernel in &vmset.kernels {
            let root = if recipe.is_custom() {
                self.image(
                    &vmset.image.image_source,
                    Some(vmset.image.image_path.as_str()),
                )?
            } else {
                self.image(kernel.image_source.as_deref().unwrap_or_default(), None)?
            };
            let (volume_key, pool) = self.volume(&vmset.name, DEFAULT_POOL, root)?;
            let mut attachments = vec![VolumeAttachment {
                volume_key,
                pool,
                mount_point: ROOT_MOUNT_POINT.to_string(),
            }];

            for disk in &vmset.disks {
                let image = self.image(&disk.source, None)?;
                let (volume_key, pool) = self.volume(&vmset.name, &disk.pool_type, image)?;
                attachments.push(VolumeAttachment {
                    volume_key,
                    pool,
                    mount_point: disk.mount_point.clone(),
                });
            }

            self.plan
                .attachments
                .entry(vmset.name.clone())
                .or_default()
                .insert(kernel.tag.clone(), attachments);
        }
        Ok(())
    }
}

impl VolumeManager {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    /// Plans the base volumes of every vm set placed on one instance.
    /// Identical images of the same pool type become one volume.
    pub fn plan_volumes(&self, vmsets: &[VmSet]) -> Result<VolumePlan, VolumeError> {
        let mut planner = Planner {
            layout: &self.layout,
            plan: VolumePlan::default(),
            by_image: HashMap::new(),
            names: HashMap::new(),
        };
        for vmset in vmsets {
            planner.attach(vmset)?;
        }
        info!(
            "Planned {} volumes for {} vm sets",
            planner.plan.volumes.len(),
            vmsets.len()
        );
        Ok(planner.plan)
    }

    pub async fn setup_volume(
        &self,
        volume: &LibvirtVolume,
        is_local: bool,
        runner: &(dyn CommandRunner + Send + Sync),
        engine: &(dyn ResourceEngine + Send + Sync),
        deps: &[ResourceHandle],
    ) -> Result<ResourceHandle, VolumeError> {
        let name = volume.resource_name();
        debug!("Setting up volume {}", name);
        if is_local {
            let args = ResourceArgs::Volume {
                name: volume.image.image_name.clone(),
                pool: volume.pool.clone(),
                xml: volume.xml(),
                source: Some(volume.image.image_path.clone()),
            };
            return engine
                .create(&format!("{}-build-libvirt-basevolume", name), args, deps)
                .await
                .map_err(|err| VolumeError::Setup {
                    volume: name,
                    message: err.to_string(),
                });
        }

        self.setup_remote_volume(&name, volume, runner, deps)
            .await
            .map_err(|err| VolumeError::Setup {
                volume: name.clone(),
                message: err.to_string(),
            })
    }

    async fn setup_remote_volume(
        &self,
        name: &str,
        volume: &LibvirtVolume,
        runner: &(dyn CommandRunner + Send + Sync),
        deps: &[ResourceHandle],
    ) -> Result<ResourceHandle, RunnerError> {
        let scratch = volume.scratch_path();
        let pool = &volume.pool;
        let image_name = &volume.image.image_name;

        let xml_written = runner
            .command(
                &format!("{}-write-vol-xml", name),
                CommandArgs::new(format!("cat > {}", scratch))
                    .with_stdin(volume.xml())
                    .with_delete(format!("rm -f {}", scratch)),
                &[],
            )
            .await?;

        let mut create_deps = deps.to_vec();
        create_deps.push(xml_written);
        let created = runner
            .command(
                &format!("{}-build-libvirt-basevolume", name),
                CommandArgs::new(format!("virsh vol-create {} {}", pool, scratch))
                    .with_delete(format!("virsh vol-delete {} --pool {}", volume.key, pool))
                    .with_sudo(),
                &create_deps,
            )
            .await?;

        let uploaded = runner
            .command(
                &format!("{}-upload-libvirt-basevolume", name),
                CommandArgs::new(format!(
                    "virsh vol-upload --pool {} {} {}",
                    pool,
                    image_name,
                    volume.image.image_path.display()
                ))
                .with_sudo(),
                &[created],
            )
            .await?;

        let key = runner
            .command(
                &format!("{}-volume-key", name),
                CommandArgs::new(format!("virsh vol-key --pool {} {}", pool, image_name))
                    .with_sudo()
                    .transient(),
                &[uploaded],
            )
            .await?;
        let key = key
            .output(ResourceHandle::STDOUT)
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .unwrap_or(volume.key.as_str())
            .to_string();

        Ok(ResourceHandle::new(ResourceKind::Volume, name, &key)
            .with_output(ResourceHandle::POOL, pool.as_str())
            .with_output(ResourceHandle::VOLUME, image_name.as_str()))
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use mockall::Sequence;

    use super::{VolumeError, VolumeManager, ROOT_MOUNT_POINT};
    use crate::config::{Disk, Kernel, VmSet};
    use crate::engine::{ResourceArgs, ResourceHandle, ResourceKind};
    use crate::storage::download::{DownloadPlan, ImageSource};
    use crate::storage::StorageLayout;
    use crate::utils::test_utilities::{
        create_command_handle, create_example_vmset, MockCommandRunner, MockResourceEngine,
    };

    fn create_manager() -> VolumeManager {
        VolumeManager::new(StorageLayout::new(PathBuf::from("/kvt"), String::from("dev")))
    }

    fn create_distro_set(name: &str, sources: &[(&str, &str)]) -> VmSet {
        let mut vmset = create_example_vmset();
        vmset.name = name.to_string();
        vmset.recipe = String::from("distro-x86_64");
        vmset.image = Default::default();
        vmset.kernels = sources
            .iter()
            .map(|(tag, source)| Kernel {
                dir: format!("kernel-{}", tag),
                tag: tag.to_string(),
                image_source: Some(source.to_string()),
                extra_params: Default::default(),
            })
            .collect();
        vmset
    }

    #[test]
    fn custom_recipe_shares_one_base_volume() {
        let plan = create_manager().plan_volumes(&[create_example_vmset()]).unwrap();
        assert_eq!(plan.volumes.len(), 1);
        let volume = &plan.volumes[0];
        assert_eq!(volume.pool, "dev-set-a-default");
        assert_eq!(volume.key, "/kvt/libvirt/pools/dev-set-a-default/bullseye.qcow2");

        let k1 = plan.attachments_for("set-a", "k1").unwrap();
        let k2 = plan.attachments_for("set-a", "k2").unwrap();
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 1);
        assert_eq!(k1[0].mount_point, ROOT_MOUNT_POINT);
        assert!(k1[0].is_root());
        assert!(volume
            .xml()
            .contains("<key>/kvt/libvirt/pools/dev-set-a-default/bullseye.qcow2</key>"));
    }

    #[test]
    fn identical_sources_across_sets_fetched_once() {
        let source = "https://images.example.com/ubuntu.qcow2";
        let sets = vec![
            create_distro_set(
                "set-a",
                &[("k1", source), ("k2", "https://images.example.com/fedora.qcow2")],
            ),
            create_distro_set("set-b", &[("k1", source)]),
        ];
        let plan = create_manager().plan_volumes(&sets).unwrap();
        assert_eq!(plan.volumes.len(), 2);
        assert_eq!(
            plan.attachments_for("set-a", "k1"),
            plan.attachments_for("set-b", "k1")
        );

        let downloads = DownloadPlan::new(plan.images());
        assert_eq!(downloads.tasks.len(), 2);
        assert_eq!(
            plan.volumes[0].image.image_path,
            PathBuf::from("/kvt/rootfs/dev/ubuntu.qcow2")
        );
    }

    #[test]
    fn local_file_images_are_used_in_place() {
        let vmset = create_distro_set("set-a", &[("k1", "file:///images/jammy.qcow2")]);
        let plan = create_manager().plan_volumes(&[vmset]).unwrap();
        assert_eq!(
            plan.volumes[0].image.source,
            ImageSource::File(PathBuf::from("/images/jammy.qcow2"))
        );
        assert_eq!(
            plan.volumes[0].image.image_path,
            PathBuf::from("/images/jammy.qcow2")
        );
    }

    #[test]
    fn extra_disks_follow_the_root_volume() {
        let mut vmset = create_example_vmset();
        vmset.disks = vec![Disk {
            pool_type: String::from("ram"),
            source: String::from("https://images.example.com/docker.qcow2"),
            target: String::from("/dev/vdb"),
            size: Some(String::from("2G")),
            mount_point: String::from("/mnt/docker"),
        }];
        let plan = create_manager().plan_volumes(&[vmset]).unwrap();
        assert_eq!(plan.volumes.len(), 2);
        let attachments = plan.attachments_for("set-a", "k2").unwrap();
        assert_eq!(attachments.len(), 2);
        assert!(attachments[0].is_root());
        assert_eq!(attachments[1].pool, "dev-set-a-ram");
        assert_eq!(attachments[1].mount_point, "/mnt/docker");
    }

    #[test]
    fn clashing_volume_names_rejected() {
        let vmset = create_distro_set(
            "set-a",
            &[
                ("k1", "file:///images/a/rootfs.qcow2"),
                ("k2", "file:///images/b/rootfs.qcow2"),
            ],
        );
        assert!(matches!(
            create_manager().plan_volumes(&[vmset]),
            Err(VolumeError::DuplicateVolumeName { .. })
        ));
    }

    #[tokio::test]
    async fn remote_volume_is_created_then_uploaded() {
        let manager = create_manager();
        let plan = manager.plan_volumes(&[create_example_vmset()]).unwrap();
        let mut runner = MockCommandRunner::new();
        let engine = MockResourceEngine::new();
        let mut seq = Sequence::new();
        let expected = [
            "cat > /tmp/volume-dev-set-a-default-bullseye.qcow2.xml",
            "virsh vol-create dev-set-a-default /tmp/volume-dev-set-a-default-bullseye.qcow2.xml",
            "virsh vol-upload --pool dev-set-a-default bullseye.qcow2 /kvt/rootfs/dev/bullseye.qcow2",
            "virsh vol-key --pool dev-set-a-default bullseye.qcow2",
        ];
        for create in expected {
            runner
                .expect_command()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |name, args, _| {
                    assert_eq!(args.create, create);
                    let stdout = if args.transient {
                        "/kvt/libvirt/pools/dev-set-a-default/bullseye.qcow2\n"
                    } else {
                        ""
                    };
                    Ok(create_command_handle(name, stdout))
                });
        }

        let handle = manager
            .setup_volume(&plan.volumes[0], false, &runner, &engine, &[])
            .await
            .unwrap();
        assert_eq!(handle.kind, ResourceKind::Volume);
        assert_eq!(handle.id, "/kvt/libvirt/pools/dev-set-a-default/bullseye.qcow2");
        assert_eq!(handle.output(ResourceHandle::POOL), Some("dev-set-a-default"));
    }

    #[tokio::test]
    async fn local_volume_goes_through_the_engine() {
        let manager = create_manager();
        let plan = manager.plan_volumes(&[create_example_vmset()]).unwrap();
        let runner = MockCommandRunner::new();
        let mut engine = MockResourceEngine::new();
        engine.expect_create().times(1).returning(|name, args, _| {
            match args {
                ResourceArgs::Volume { source, pool, .. } => {
                    assert_eq!(pool, "dev-set-a-default");
                    assert_eq!(source, Some(PathBuf::from("/kvt/rootfs/dev/bullseye.qcow2")));
                }
                other => panic!("unexpected resource {:?}", other),
            }
            Ok(ResourceHandle::new(ResourceKind::Volume, name, "key"))
        });

        let handle = manager
            .setup_volume(&plan.volumes[0], true, &runner, &engine, &[])
            .await
            .unwrap();
        assert_eq!(handle.id, "key");
    }
}
