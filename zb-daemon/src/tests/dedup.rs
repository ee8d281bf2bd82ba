// SPDX-License-Identifier: MIT

//! Concurrent realize requests for the same derivation coalesce onto
//! one builder invocation.

use super::test_store::{TestStore, sh_derivation};

#[tokio::test]
async fn concurrent_realizes_share_one_builder() {
    let ts = TestStore::new();
    let counter = ts.scratch_file("dedup-runs");

    // The builder sleeps briefly so the requests overlap.
    let drv = sh_derivation(
        "contended",
        &format!(
            "echo ran >> {} && sleep 0.3 && echo done > \"$out\"",
            counter.display()
        ),
    );
    let drv_path = ts.add_derivation(&drv).await;

    let mut build_ids = Vec::new();
    for _ in 0..16 {
        let id = ts
            .realizer
            .realize(vec![drv_path.clone()], false)
            .await
            .expect("realize");
        build_ids.push(id);
    }

    for id in &build_ids {
        let row = ts.wait_build(id).await;
        assert_eq!("success", row.status, "build {id} must succeed");
    }

    let runs = std::fs::read_to_string(&counter).unwrap();
    assert_eq!(
        1,
        runs.lines().count(),
        "at most one builder per derivation path"
    );

    let out = drv.output_path(&ts.store_dir, "out").unwrap().unwrap();
    assert!(ts.fs.exists(&out).await.unwrap());
}

/// Two different derivations still build independently.
#[tokio::test]
async fn distinct_derivations_do_not_coalesce() {
    let ts = TestStore::new();
    let counter = ts.scratch_file("distinct-runs");

    let a = sh_derivation(
        "one",
        &format!("echo a >> {} && echo a > \"$out\"", counter.display()),
    );
    let b = sh_derivation(
        "two",
        &format!("echo b >> {} && echo b > \"$out\"", counter.display()),
    );
    let a_path = ts.add_derivation(&a).await;
    let b_path = ts.add_derivation(&b).await;

    let id = ts
        .realizer
        .realize(vec![a_path, b_path], false)
        .await
        .expect("realize");
    let row = ts.wait_build(&id).await;
    assert_eq!("success", row.status);

    let runs = std::fs::read_to_string(&counter).unwrap();
    assert_eq!(2, runs.lines().count());
}
