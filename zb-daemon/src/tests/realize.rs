// SPDX-License-Identifier: MIT

//! End-to-end realize tests: cache behavior, failure handling, cycle
//! rejection, and content-addressed outputs with self-references.

use std::collections::BTreeSet;

use super::test_store::{TestStore, sh_derivation};
use zb_store_core::content_address::CaMethod;
use zb_store_core::derivation::OutputSpec;
use zb_store_core::hash::HashAlgo;
use zb_store_core::{ContentAddress, StorePath};

/// A successful build realizes the output, registers its object info,
/// and a second realize is served from cache without running the
/// builder again.
#[tokio::test]
async fn realize_success_then_cache_hit() {
    let ts = TestStore::new();
    let counter = ts.scratch_file("runs");

    let drv = sh_derivation(
        "hello",
        &format!("echo ran >> {} && echo 'hello world' > \"$out\"", counter.display()),
    );
    let drv_path = ts.add_derivation(&drv).await;

    let build_id = ts
        .realizer
        .realize(vec![drv_path.clone()], false)
        .await
        .expect("realize");
    let row = ts.wait_build(&build_id).await;
    assert_eq!("success", row.status);

    let out_path = drv
        .output_path(&ts.store_dir, "out")
        .unwrap()
        .expect("input-addressed path");
    assert!(ts.fs.exists(&out_path).await.unwrap(), "output registered");

    let info = ts.fs.object_info(&out_path).await.unwrap().unwrap();
    let on_disk = std::path::PathBuf::from(ts.store_dir.display_path(&out_path));
    let (recomputed, size) = zb_nar::nar_hash(&on_disk).await.unwrap();
    assert_eq!(info.nar_hash, recomputed.to_string(), "recorded hash matches disk");
    assert_eq!(info.nar_size, size);

    // Second realize: no new builder invocation.
    let second = ts
        .realizer
        .realize(vec![drv_path.clone()], false)
        .await
        .expect("realize again");
    let row = ts.wait_build(&second).await;
    assert_eq!("success", row.status);

    let runs = std::fs::read_to_string(&counter).unwrap();
    assert_eq!(1, runs.lines().count(), "builder must run exactly once");
}

/// A failing builder yields status `fail`, captures the log, and with
/// keepFailed the scratch directory named in the log survives.
#[tokio::test]
async fn builder_failure_keeps_scratch_when_requested() {
    let ts = TestStore::new();

    let drv = sh_derivation("flaky", "echo about to exit 1 >&2; exit 1");
    let drv_path = ts.add_derivation(&drv).await;

    let build_id = ts
        .realizer
        .realize(vec![drv_path.clone()], true)
        .await
        .expect("realize");
    let row = ts.wait_build(&build_id).await;
    assert_eq!("fail", row.status);

    let log = ts.read_full_log(&build_id, &drv_path).await;
    assert!(log.contains("exit 1"), "stderr must be captured: {log:?}");

    let kept = log
        .lines()
        .find_map(|l| l.strip_prefix("note: keeping build directory "))
        .expect("log names the kept scratch directory");
    assert!(
        std::path::Path::new(kept).exists(),
        "scratch directory must survive"
    );

    let out_path = drv.output_path(&ts.store_dir, "out").unwrap().unwrap();
    assert!(!ts.fs.exists(&out_path).await.unwrap(), "no output registered");
}

/// A derivation closure containing a cycle is rejected before any
/// builder runs.
#[tokio::test]
async fn cycle_is_rejected() {
    let ts = TestStore::new();
    let counter = ts.scratch_file("cycle-runs");

    let fake_path: StorePath = "cccccccccccccccccccccccccccccccc-loop.drv".parse().unwrap();
    let mut drv = sh_derivation(
        "loop",
        &format!("echo ran >> {} && echo x > \"$out\"", counter.display()),
    );
    drv.input_derivations
        .insert(fake_path.clone(), BTreeSet::from(["out".to_string()]));
    ts.add_derivation_at(&drv, &fake_path).await;

    let build_id = ts
        .realizer
        .realize(vec![fake_path], false)
        .await
        .expect("realize starts");
    let row = ts.wait_build(&build_id).await;
    assert_eq!("error", row.status);
    assert!(!counter.exists(), "no builder may run");
}

/// A failure fails its transitive dependents with `fail` while
/// independent branches build to completion.
#[tokio::test]
async fn failure_isolation() {
    let ts = TestStore::new();

    let failing = sh_derivation("broken", "exit 1");
    let failing_path = ts.add_derivation(&failing).await;

    let mut dependent = sh_derivation("needs-broken", "echo x > \"$out\"");
    dependent
        .input_derivations
        .insert(failing_path.clone(), BTreeSet::from(["out".to_string()]));
    let dependent_path = ts.add_derivation(&dependent).await;

    let independent = sh_derivation("standalone", "echo y > \"$out\"");
    let independent_path = ts.add_derivation(&independent).await;

    let build_id = ts
        .realizer
        .realize(vec![dependent_path.clone(), independent_path.clone()], false)
        .await
        .expect("realize");
    let row = ts.wait_build(&build_id).await;
    assert_eq!("fail", row.status);

    let results = {
        let id = build_id.clone();
        ts.fs
            .db()
            .read(move |db| db.build_results(&id))
            .await
            .unwrap()
    };
    let status_of = |p: &StorePath| {
        let abs = ts.store_dir.display_path(p);
        results
            .iter()
            .find(|r| r.drv_path == abs)
            .map(|r| r.status.clone())
            .unwrap_or_else(|| panic!("no result for {abs}"))
    };
    assert_eq!("fail", status_of(&failing_path));
    assert_eq!("fail", status_of(&dependent_path));
    assert_eq!("success", status_of(&independent_path));

    let out = independent.output_path(&ts.store_dir, "out").unwrap().unwrap();
    assert!(ts.fs.exists(&out).await.unwrap());
}

/// A fixed CA output whose bytes do not match the pin fails with a hash
/// mismatch.
#[tokio::test]
async fn fixed_output_hash_mismatch_fails() {
    let ts = TestStore::new();

    let pin = ContentAddress::Flat(HashAlgo::Sha256.digest("hello world\n"));
    let mut drv = sh_derivation("pinned", "printf 'something else' > \"$out\"");
    drv.outputs.insert("out".into(), OutputSpec::CaFixed(pin));
    let drv_path = ts.add_derivation(&drv).await;

    let build_id = ts.realizer.realize(vec![drv_path.clone()], false).await.unwrap();
    let row = ts.wait_build(&build_id).await;
    assert_eq!("fail", row.status);

    let log = ts.read_full_log(&build_id, &drv_path).await;
    assert!(log.contains("hash mismatch"), "log: {log:?}");
}

/// ...and succeeds when the bytes match, at the deterministic pinned
/// path.
#[tokio::test]
async fn fixed_output_matching_pin_succeeds() {
    let ts = TestStore::new();

    let pin = ContentAddress::Flat(HashAlgo::Sha256.digest("hello world\n"));
    let mut drv = sh_derivation("pinned", "printf 'hello world\\n' > \"$out\"");
    drv.outputs.insert("out".into(), OutputSpec::CaFixed(pin.clone()));
    let drv_path = ts.add_derivation(&drv).await;

    let build_id = ts.realizer.realize(vec![drv_path], false).await.unwrap();
    let row = ts.wait_build(&build_id).await;
    assert_eq!("success", row.status);

    let out = drv.output_path(&ts.store_dir, "out").unwrap().unwrap();
    assert!(ts.fs.exists(&out).await.unwrap());
    let info = ts.fs.object_info(&out).await.unwrap().unwrap();
    assert_eq!(Some(pin.to_string()), info.ca);
}

/// A floating CA output embedding its own path is content-addressed
/// modulo the self-reference, rewritten to the final digest, and
/// registered with a self-reference.
#[tokio::test]
async fn floating_output_with_self_reference() {
    let ts = TestStore::new();

    let mut drv = sh_derivation("selfy", "mkdir \"$out\" && echo \"$out\" > \"$out\"/self");
    drv.outputs.insert(
        "out".into(),
        OutputSpec::CaFloating {
            method: CaMethod::Recursive,
            algo: HashAlgo::Sha256,
        },
    );
    let drv_path = ts.add_derivation(&drv).await;

    let build_id = ts.realizer.realize(vec![drv_path.clone()], false).await.unwrap();
    let row = ts.wait_build(&build_id).await;
    assert_eq!("success", row.status);

    let outputs = ts.realizer.output_status(&drv_path).await.unwrap();
    let (_, path, valid) = outputs.into_iter().find(|(n, _, _)| n == "out").unwrap();
    let final_path = path.expect("realization recorded");
    assert!(valid);

    let abs = ts.store_dir.display_path(&final_path);
    let contents = std::fs::read_to_string(format!("{abs}/self")).unwrap();
    assert_eq!(
        format!("{abs}\n"),
        contents,
        "self-reference must be rewritten to the final path"
    );

    let info = ts.fs.object_info(&final_path).await.unwrap().unwrap();
    assert!(info.references.contains(&abs), "self-reference registered");
    assert!(info.ca.is_some(), "content address recorded");

    // Realizing again substitutes the recorded realization.
    let second = ts.realizer.realize(vec![drv_path], false).await.unwrap();
    let row = ts.wait_build(&second).await;
    assert_eq!("success", row.status);
}

/// Canceling an active build records an `error` terminal state.
#[tokio::test]
async fn cancel_interrupts_build() {
    let ts = TestStore::new();

    let drv = sh_derivation("sleepy", "sleep 600; echo never > \"$out\"");
    let drv_path = ts.add_derivation(&drv).await;

    let build_id = ts.realizer.realize(vec![drv_path], false).await.unwrap();

    // Give the builder a moment to start, then cancel.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert!(ts.realizer.cancel_build(&build_id).await);

    let row = ts.wait_build(&build_id).await;
    assert_eq!("error", row.status);
}
