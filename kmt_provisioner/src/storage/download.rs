use std::{
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use serde::Serialize;
use url::Url;

use super::volume::{FilesystemImage, VolumeError};
use crate::engine::ResourceHandle;
use crate::runner::{CommandArgs, CommandRunner};

const FIO_REFRESH: &str = "fio --filename={path} --rw=read --bs=64m --iodepth=32 --ioengine=libaio --direct=1 --name=volume-initialize";
const ARIA2_CONNECTIONS: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ImageSource {
    File(PathBuf),
    Web(String),
}

impl ImageSource {
    pub fn parse(source: &str) -> Result<Self, VolumeError> {
        let invalid = |message: String| VolumeError::InvalidSource {
            uri: source.to_string(),
            message,
        };
        let url = Url::parse(source).map_err(|err| invalid(err.to_string()))?;
        match url.scheme() {
            "file" => url
                .to_file_path()
                .map(ImageSource::File)
                .map_err(|_| invalid(String::from("not an absolute file path"))),
            "http" | "https" => Ok(ImageSource::Web(source.to_string())),
            other => Err(invalid(format!("unsupported scheme {}", other))),
        }
    }

    /// Last path segment, used to name images that have no explicit name.
    pub fn file_name(&self) -> Option<String> {
        match self {
            ImageSource::File(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().to_string()),
            ImageSource::Web(source) => Url::parse(source)
                .ok()?
                .path_segments()?
                .filter(|segment| !segment.is_empty())
                .last()
                .map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DownloadTask {
    /// Image already present on the host. Reading it once forces a lazily
    /// populated block store to fetch every block.
    Refresh { path: PathBuf },
    Fetch { url: String, destination: PathBuf },
}

/// Download work for one instance. Every destination appears once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownloadPlan {
    pub tasks: Vec<DownloadTask>,
}

impl DownloadPlan {
    /// Location of the aria2 input file on the instance host.
    pub fn config_path(stack: &str) -> String {
        format!("/tmp/aria2-{}.config", stack)
    }

    pub fn new<'a>(images: impl IntoIterator<Item = &'a FilesystemImage>) -> Self {
        let mut tasks: Vec<DownloadTask> = vec![];
        let mut planned: HashMap<PathBuf, &ImageSource> = HashMap::new();
        for image in images {
            if let Some(existing) = planned.get(&image.image_path) {
                if *existing != &image.source {
                    warn!(
                        "Image {:?} is requested from {:?} and {:?}, keeping the first source",
                        image.image_path, existing, image.source
                    );
                }
                continue;
            }
            planned.insert(image.image_path.clone(), &image.source);
            tasks.push(match &image.source {
                ImageSource::File(_) => DownloadTask::Refresh {
                    path: image.image_path.clone(),
                },
                ImageSource::Web(url) => DownloadTask::Fetch {
                    url: url.clone(),
                    destination: image.image_path.clone(),
                },
            });
        }
        Self { tasks }
    }

    fn fetches(&self) -> impl Iterator<Item = (&String, &PathBuf)> {
        self.tasks.iter().filter_map(|task| match task {
            DownloadTask::Fetch { url, destination } => Some((url, destination)),
            DownloadTask::Refresh { .. } => None,
        })
    }

    pub fn aria2_config(&self) -> String {
        self.fetches()
            .map(|(url, destination)| {
                let dir = destination.parent().unwrap_or_else(|| Path::new("/"));
                let out = destination
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .unwrap_or_default();
                format!("{}\n dir={}\n out={}\n", url, dir.display(), out)
            })
            .collect()
    }

    /// Concurrent aria2 downloads, one per distinct destination directory.
    pub fn parallelism(&self) -> usize {
        self.fetches()
            .filter_map(|(_, destination)| destination.parent())
            .collect::<BTreeSet<_>>()
            .len()
            .max(1)
    }

    pub fn refresh_command(path: &Path) -> CommandArgs {
        CommandArgs::new(FIO_REFRESH.replace("{path}", &path.to_string_lossy()))
    }

    /// Runs the plan on an instance. Local images need no refresh since they
    /// are not backed by a lazily populated store.
    pub async fn execute(
        &self,
        aria2_config_path: &str,
        is_local: bool,
        runner: &(dyn CommandRunner + Send + Sync),
        deps: &[ResourceHandle],
    ) -> Result<Vec<ResourceHandle>, VolumeError> {
        let download_error =
            |err: crate::runner::RunnerError| VolumeError::Download(err.to_string());
        let mut ready = vec![];

        if !is_local {
            for task in &self.tasks {
                if let DownloadTask::Refresh { path } = task {
                    let name = format!("refresh-{}", path.display());
                    debug!("Refreshing image {:?}", path);
                    ready.push(
                        runner
                            .command(&name, Self::refresh_command(path), deps)
                            .await
                            .map_err(download_error)?,
                    );
                }
            }
        }

        let destinations: Vec<String> = self
            .fetches()
            .map(|(_, destination)| destination.to_string_lossy().to_string())
            .collect();
        if destinations.is_empty() {
            return Ok(ready);
        }

        info!("Downloading {} images with aria2", destinations.len());
        let config_written = runner
            .command(
                "write-aria2c-config",
                CommandArgs::new(format!("cat > {}", aria2_config_path))
                    .with_stdin(self.aria2_config())
                    .with_delete(format!("rm -f {}", aria2_config_path)),
                deps,
            )
            .await
            .map_err(download_error)?;
        let downloaded = runner
            .command(
                "download-with-aria2c",
                CommandArgs::new(format!(
                    "aria2c -i {} -x {} -j {}",
                    aria2_config_path,
                    ARIA2_CONNECTIONS,
                    self.parallelism()
                ))
                .with_delete(format!("rm -f {}", destinations.join(" "))),
                &[config_written],
            )
            .await
            .map_err(download_error)?;
        ready.push(downloaded);
        Ok(ready)
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use mockall::Sequence;

    use super::{DownloadPlan, DownloadTask, ImageSource};
    use crate::storage::volume::{FilesystemImage, VolumeError};
    use crate::utils::test_utilities::{create_command_handle, MockCommandRunner};

    fn create_image(source: &str, path: &str) -> FilesystemImage {
        FilesystemImage {
            image_name: PathBuf::from(path)
                .file_name()
                .unwrap()
                .to_string_lossy()
                .to_string(),
            image_path: PathBuf::from(path),
            source: ImageSource::parse(source).unwrap(),
        }
    }

    #[test]
    fn source_schemes() {
        assert_eq!(
            ImageSource::parse("file:///home/kvt/rootfs/bullseye.qcow2").unwrap(),
            ImageSource::File(PathBuf::from("/home/kvt/rootfs/bullseye.qcow2"))
        );
        let web = ImageSource::parse("https://images.example.com/jammy/ubuntu.qcow2").unwrap();
        assert_eq!(web.file_name().as_deref(), Some("ubuntu.qcow2"));
        assert!(matches!(
            ImageSource::parse("s3://bucket/image.qcow2"),
            Err(VolumeError::InvalidSource { .. })
        ));
        assert!(matches!(
            ImageSource::parse("not a url"),
            Err(VolumeError::InvalidSource { .. })
        ));
    }

    #[test]
    fn identical_destinations_fetched_once() {
        let images = vec![
            create_image("https://images.example.com/ubuntu.qcow2", "/kvt/rootfs/dev/ubuntu.qcow2"),
            create_image("https://images.example.com/ubuntu.qcow2", "/kvt/rootfs/dev/ubuntu.qcow2"),
            create_image("https://images.example.com/debian.qcow2", "/kvt/rootfs/dev/debian.qcow2"),
            create_image("file:///kvt/rootfs/local.qcow2", "/kvt/rootfs/local.qcow2"),
            create_image("file:///kvt/rootfs/local.qcow2", "/kvt/rootfs/local.qcow2"),
        ];
        let plan = DownloadPlan::new(&images);
        assert_eq!(plan.tasks.len(), 3);
        let fetches = plan
            .tasks
            .iter()
            .filter(|task| matches!(task, DownloadTask::Fetch { .. }))
            .count();
        assert_eq!(fetches, 2);
        assert_eq!(plan.parallelism(), 1);
        assert_eq!(
            plan.aria2_config(),
            "https://images.example.com/ubuntu.qcow2\n dir=/kvt/rootfs/dev\n out=ubuntu.qcow2\n\
             https://images.example.com/debian.qcow2\n dir=/kvt/rootfs/dev\n out=debian.qcow2\n"
        );
    }

    #[test]
    fn refresh_reads_through_the_block_device() {
        let args = DownloadPlan::refresh_command(&PathBuf::from("/kvt/rootfs/local.qcow2"));
        assert!(args.create.starts_with("fio --filename=/kvt/rootfs/local.qcow2 --rw=read"));
        assert_eq!(args.delete, None);
    }

    #[tokio::test]
    async fn remote_plan_batches_fetches() {
        let images = vec![
            create_image("file:///kvt/rootfs/local.qcow2", "/kvt/rootfs/local.qcow2"),
            create_image("https://images.example.com/ubuntu.qcow2", "/kvt/rootfs/dev/ubuntu.qcow2"),
            create_image("https://images.example.com/debian.qcow2", "/kvt/disks/dev/debian.qcow2"),
        ];
        let plan = DownloadPlan::new(&images);
        let mut runner = MockCommandRunner::new();
        let mut seq = Sequence::new();
        runner
            .expect_command()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|name, args, _| {
                assert!(args.create.starts_with("fio"));
                Ok(create_command_handle(name, ""))
            });
        runner
            .expect_command()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|name, args, _| {
                assert_eq!(name, "write-aria2c-config");
                assert_eq!(args.create, "cat > /tmp/aria2-dev.config");
                assert!(args.stdin.unwrap().contains(" out=debian.qcow2\n"));
                Ok(create_command_handle(name, ""))
            });
        runner
            .expect_command()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|name, args, deps| {
                assert_eq!(args.create, "aria2c -i /tmp/aria2-dev.config -x 16 -j 2");
                assert_eq!(
                    args.delete.as_deref(),
                    Some("rm -f /kvt/rootfs/dev/ubuntu.qcow2 /kvt/disks/dev/debian.qcow2")
                );
                assert_eq!(deps[0].name, "write-aria2c-config");
                Ok(create_command_handle(name, ""))
            });

        let ready = plan
            .execute(&DownloadPlan::config_path("dev"), false, &runner, &[])
            .await
            .unwrap();
        assert_eq!(ready.len(), 2);
    }

    #[tokio::test]
    async fn local_plan_skips_refresh() {
        let images = vec![create_image(
            "file:///kvt/rootfs/local.qcow2",
            "/kvt/rootfs/local.qcow2",
        )];
        let runner = MockCommandRunner::new();
        let ready = DownloadPlan::new(&images)
            .execute("/tmp/aria2-dev.config", true, &runner, &[])
            .await
            .unwrap();
        assert!(ready.is_empty());
    }
}
