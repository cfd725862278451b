//! End-to-end behavior of image indexes over real saved images.

mod common;

use common::write_base_layout;
use oci_registry::manifest::{MediaTypeFamily, OciDescriptor, Platform};
use ocibuild::{Error, ImageIndex, ImageOptions, LayoutImage};

/// Save two platform-variant images and return their index descriptors.
async fn two_saved_images(root: &std::path::Path) -> Vec<OciDescriptor> {
    let mut descriptors = Vec::new();
    for (i, (os, arch)) in [("linux", "amd64"), ("linux", "arm64")].iter().enumerate() {
        let base_dir = root.join(format!("base-{}", i));
        write_base_layout(
            &base_dir,
            &[format!("base layer for {}", arch).as_bytes()],
            MediaTypeFamily::Oci,
            false,
            false,
        )
        .await;

        let opts = ImageOptions::default().from_base_image_path(&base_dir);
        let mut image = LayoutImage::new(root.join(format!("image-{}", i)), opts)
            .await
            .expect("new image");
        image.set_os(*os);
        image.set_architecture(*arch);
        let mut descriptor = image.save(&[]).await.expect("save");
        descriptor.platform = Some(Platform {
            os: (*os).to_owned(),
            architecture: (*arch).to_owned(),
            ..Default::default()
        });
        descriptors.push(descriptor);
    }
    descriptors
}

#[tokio::test]
async fn per_child_platform_edit_touches_one_descriptor() {
    let root = tempfile::tempdir().expect("tempdir");
    let descriptors = two_saved_images(root.path()).await;
    let (a, b) = (
        descriptors[0].digest.clone(),
        descriptors[1].digest.clone(),
    );

    let index_path = root.path().join("index");
    let mut index = ImageIndex::create("example.com/app-index:latest", &index_path, MediaTypeFamily::Oci)
        .await
        .expect("create index");
    for descriptor in descriptors {
        index.add_descriptor(descriptor);
    }
    index.set_os(&a, "some-os").expect("set os");
    index.save().await.expect("save index");

    let reloaded = ImageIndex::load("example.com/app-index:latest", &index_path)
        .await
        .expect("reload");
    assert_eq!("some-os", reloaded.os(&a).expect("edited os"));
    assert_eq!("linux", reloaded.os(&b).expect("untouched os"));
    assert_eq!("arm64", reloaded.architecture(&b).expect("untouched arch"));
}

#[tokio::test]
async fn removing_a_child_makes_its_reads_fail() {
    let root = tempfile::tempdir().expect("tempdir");
    let descriptors = two_saved_images(root.path()).await;
    let a = descriptors[0].digest.clone();

    let index_path = root.path().join("index");
    let mut index = ImageIndex::create("example.com/app-index:latest", &index_path, MediaTypeFamily::Oci)
        .await
        .expect("create index");
    for descriptor in descriptors {
        index.add_descriptor(descriptor);
    }
    index.remove(&a);
    index.save().await.expect("save index");

    let reloaded = ImageIndex::load("example.com/app-index:latest", &index_path)
        .await
        .expect("reload");
    assert_eq!(1, reloaded.manifests().len());
    assert!(matches!(
        reloaded.os(&a),
        Err(Error::NoImageOrIndexFound { .. })
    ));
}
