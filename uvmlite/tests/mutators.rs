//! Device and topology mutators in each lifecycle phase.

mod common;

use std::sync::Arc;

use uuid::Uuid;
use uvmlite::hcs::{EmulatedComputeService, HcsOp};
use uvmlite::hvsock::{HvSocketListener, LoopbackHvSocket, ServiceId};
use uvmlite::schema::{Memory, options};
use uvmlite::source::LinuxSource;
use uvmlite::trace::NoopSink;
use uvmlite::vm::{
    Capabilities, ComPortControl, HvSocketListen, LinuxBoot, MemoryBackingType, MemoryConfig,
    MemoryConfigControl, MemoryControl, MmioConfigControl, Network, ProcessorControl, Scsi,
    ScsiDiskType, UefiBoot, VpMem, VpMemImageFormat,
};
use uvmlite::{OpContext, SourceOptions, State, UtilityVm, Uvm, UvmError, UvmResult};
use uvmlite_shared::constants::resource_paths;

use common::Harness;

fn memory(uvm: &UtilityVm) -> &Memory {
    uvm.document()
        .virtual_machine
        .as_ref()
        .and_then(|vm| vm.compute_topology.as_ref())
        .and_then(|topology| topology.memory.as_ref())
        .unwrap()
}

async fn created(h: &Harness, id: &str) -> UtilityVm {
    let ctx = OpContext::background();
    let mut uvm = h.source.new_utility_vm(id, "tests");
    uvm.add_scsi_controller(&ctx, 0).await.unwrap();
    uvm.add_vpmem_controller(&ctx, 8, 1 << 30).await.unwrap();
    uvm.create(&ctx).await.unwrap();
    uvm
}

#[tokio::test]
async fn test_pre_created_mutators_edit_document() {
    let h = Harness::new();
    let ctx = OpContext::background();
    let mut uvm = h.source.new_utility_vm("uvm-doc", "tests");

    uvm.set_memory_limit(&ctx, 2048).await.unwrap();
    uvm.set_memory_config(
        &ctx,
        &MemoryConfig {
            backing_type: MemoryBackingType::Physical,
            deferred_commit: true,
            cold_hint: true,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    uvm.set_mmio_config(&ctx, 256, 4096, 1024).await.unwrap();
    uvm.set_processor_count(&ctx, 4).await.unwrap();

    let mem = memory(&uvm);
    assert_eq!(mem.size_in_mb, 2048);
    assert!(!mem.allow_overcommit);
    assert!(mem.enable_deferred_commit);
    assert!(mem.enable_cold_hint);
    assert!(!mem.enable_hot_hint);
    assert_eq!(mem.low_mmio_gap_in_mb, 256);
    assert_eq!(mem.high_mmio_base_in_mb, 4096);
    assert_eq!(mem.high_mmio_gap_in_mb, 1024);

    let nic = Uuid::new_v4();
    uvm.add_scsi_controller(&ctx, 0).await.unwrap();
    uvm.add_vpmem_controller(&ctx, 16, 1 << 30).await.unwrap();
    uvm.add_vpmem_device(&ctx, 0, r"C:\lcow\rootfs.vhdx", true, VpMemImageFormat::VHDX)
        .await
        .unwrap();
    uvm.add_nic(&ctx, nic, "endpoint-1", "00-15-5D-00-00-01")
        .await
        .unwrap();
    uvm.set_com_port(&ctx, 0, r"\\.\pipe\uvm-doc").await.unwrap();
    uvm.set_uefi_boot(&ctx, "", "kernel", "console=ttyS0").await.unwrap();

    let doc = uvm.serialized_document().unwrap();
    let vm = &doc["VirtualMachine"];
    assert_eq!(vm["ComputeTopology"]["Processor"]["Count"], 4);
    assert_eq!(vm["Devices"]["Scsi"]["0"], serde_json::json!({}));
    assert_eq!(vm["Devices"]["VirtualPMem"]["MaximumCount"], 16);
    assert_eq!(vm["Devices"]["VirtualPMem"]["Devices"]["0"]["ImageFormat"], "Vhdx");
    assert_eq!(
        vm["Devices"]["NetworkAdapters"][nic.to_string()]["EndpointId"],
        "endpoint-1"
    );
    assert_eq!(vm["Devices"]["ComPorts"]["0"]["NamedPipe"], r"\\.\pipe\uvm-doc");
    assert_eq!(vm["Chipset"]["Uefi"]["BootThis"]["DevicePath"], r"\kernel");
    assert_eq!(vm["Chipset"]["Uefi"]["BootThis"]["DeviceType"], "VmbFs");
    assert_eq!(vm["Chipset"]["Uefi"]["BootThis"]["OptionalData"], "console=ttyS0");

    // Nothing reached the compute service yet.
    assert!(h.compute.calls().is_empty());
}

#[tokio::test]
async fn test_out_of_range_values_are_rejected() {
    let h = Harness::new();
    let ctx = OpContext::background();
    let mut uvm = h.source.new_utility_vm("uvm-range", "tests");

    let err = uvm.set_memory_limit(&ctx, 0).await.unwrap_err();
    assert!(matches!(err, UvmError::InvalidArgument(_)));
    let err = uvm
        .set_processor_count(&ctx, i32::MAX as u64 + 1)
        .await
        .unwrap_err();
    assert!(matches!(err, UvmError::InvalidArgument(_)));
    let err = uvm
        .set_mmio_config(&ctx, 0, i32::MAX as u64 + 1, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, UvmError::InvalidArgument(_)));

    let mem = memory(&uvm);
    assert_eq!(mem.size_in_mb, 0);
    assert_eq!(mem.high_mmio_base_in_mb, 0);
}

#[tokio::test]
async fn test_scsi_disk_before_create_is_not_implemented() {
    let h = Harness::new();
    let ctx = OpContext::background();
    let mut uvm = h.source.new_utility_vm("uvm-scsi-early", "tests");
    uvm.add_scsi_controller(&ctx, 0).await.unwrap();

    let err = uvm
        .add_scsi_disk(&ctx, 0, 0, "disk.vhdx", ScsiDiskType::VIRTUAL_DISK, false)
        .await
        .unwrap_err();
    assert!(matches!(err, UvmError::NotImplemented(_)));
    assert!(h.compute.calls().is_empty());
}

#[tokio::test]
async fn test_scsi_disk_hot_attach() {
    let h = Harness::without_log_forwarding();
    let ctx = OpContext::background();
    let mut uvm = created(&h, "uvm-scsi").await;

    uvm.add_scsi_disk(&ctx, 0, 1, r"C:\disks\data.vhdx", ScsiDiskType::VIRTUAL_DISK, true)
        .await
        .unwrap();

    let calls = h.compute.calls();
    let modify = calls.last().unwrap();
    assert_eq!(modify.op, HcsOp::Modify);
    assert_eq!(
        modify.resource_path.as_deref(),
        Some("VirtualMachine/Devices/Scsi/0/Attachments/1")
    );

    let doc = h.compute.document("uvm-scsi").unwrap();
    let attachment = doc
        .pointer("/VirtualMachine/Devices/Scsi/0/Attachments/1")
        .unwrap();
    assert_eq!(attachment["Type"], "VirtualDisk");
    assert_eq!(attachment["Path"], r"C:\disks\data.vhdx");
    assert_eq!(attachment["ReadOnly"], true);
}

#[tokio::test]
async fn test_scsi_disk_attach_to_running_vm_without_local_controller() {
    let h = Harness::without_log_forwarding();
    let ctx = OpContext::background();
    let mut uvm = h.source.new_utility_vm("uvm-hot-scsi", "tests");
    uvm.create(&ctx).await.unwrap();
    uvm.start(&ctx).await.unwrap();

    uvm.add_scsi_disk(&ctx, 0, 0, "/path/disk.vhdx", ScsiDiskType::VIRTUAL_DISK, true)
        .await
        .unwrap();

    assert_eq!(h.compute.count(HcsOp::Modify), 1);
    let calls = h.compute.calls();
    assert_eq!(
        calls.last().unwrap().resource_path.as_deref(),
        Some("VirtualMachine/Devices/Scsi/0/Attachments/0")
    );
    let doc = h.compute.document("uvm-hot-scsi").unwrap();
    let attachment = doc
        .pointer("/VirtualMachine/Devices/Scsi/0/Attachments/0")
        .unwrap();
    assert_eq!(attachment["Path"], "/path/disk.vhdx");
    assert_eq!(attachment["ReadOnly"], true);
}

#[tokio::test]
async fn test_scsi_disk_rejections_send_nothing() {
    let h = Harness::without_log_forwarding();
    let ctx = OpContext::background();
    let mut uvm = created(&h, "uvm-scsi-bad").await;

    let err = uvm
        .add_scsi_disk(&ctx, 0, 0, "disk.vhdx", ScsiDiskType(5), false)
        .await
        .unwrap_err();
    assert!(matches!(err, UvmError::Unsupported(_)));
    assert_eq!(h.compute.count(HcsOp::Modify), 0);
}

#[tokio::test]
async fn test_vpmem_device_requires_controller() {
    let h = Harness::without_log_forwarding();
    let ctx = OpContext::background();
    let mut uvm = h.source.new_utility_vm("uvm-no-vpmem", "tests");

    let err = uvm
        .add_vpmem_device(&ctx, 0, "rootfs.vhd", true, VpMemImageFormat::VHD1)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "VPMem controller has not been added");

    uvm.create(&ctx).await.unwrap();
    let err = uvm
        .add_vpmem_device(&ctx, 0, "rootfs.vhd", true, VpMemImageFormat::VHD1)
        .await
        .unwrap_err();
    assert!(matches!(err, UvmError::MissingPrerequisite(_)));
    assert_eq!(h.compute.count(HcsOp::Modify), 0);
}

#[tokio::test]
async fn test_vpmem_device_hot_add() {
    let h = Harness::without_log_forwarding();
    let ctx = OpContext::background();
    let mut uvm = created(&h, "uvm-vpmem").await;
    uvm.start(&ctx).await.unwrap();

    uvm.add_vpmem_device(&ctx, 3, "layer.vhd", true, VpMemImageFormat::VHD1)
        .await
        .unwrap();

    let path = format!("{}/3", resource_paths::VPMEM_DEVICES);
    let calls = h.compute.calls();
    assert_eq!(calls.last().unwrap().resource_path.as_deref(), Some(path.as_str()));

    let doc = h.compute.document("uvm-vpmem").unwrap();
    let device = doc
        .pointer("/VirtualMachine/Devices/VirtualPMem/Devices/3")
        .unwrap();
    assert_eq!(device["HostPath"], "layer.vhd");
    assert_eq!(device["ImageFormat"], "Vhd1");
}

#[tokio::test]
async fn test_nic_hot_add() {
    let h = Harness::without_log_forwarding();
    let ctx = OpContext::background();
    let mut uvm = created(&h, "uvm-nic").await;
    let nic = Uuid::new_v4();

    uvm.add_nic(&ctx, nic, "endpoint-2", "00-15-5D-00-00-02")
        .await
        .unwrap();

    let doc = h.compute.document("uvm-nic").unwrap();
    let adapter = &doc["VirtualMachine"]["Devices"]["NetworkAdapters"][nic.to_string()];
    assert_eq!(adapter["MacAddress"], "00-15-5D-00-00-02");
    // The frozen document is not edited after create.
    assert!(uvm.document().devices().unwrap().network_adapters.is_empty());
}

#[tokio::test]
async fn test_modify_failure_names_resource_path() {
    let h = Harness::without_log_forwarding();
    let ctx = OpContext::background();
    let mut uvm = created(&h, "uvm-modify-fail").await;
    h.compute.fail_next(HcsOp::Modify);

    let err = uvm
        .add_scsi_disk(&ctx, 0, 2, "disk.vhdx", ScsiDiskType::VIRTUAL_DISK, false)
        .await
        .unwrap_err();
    match err {
        UvmError::ComputeSystem {
            op, resource_path, ..
        } => {
            assert_eq!(op, "modify");
            assert_eq!(
                resource_path.as_deref(),
                Some("VirtualMachine/Devices/Scsi/0/Attachments/2")
            );
        }
        other => panic!("unexpected error: {other}"),
    }
}

/// Run every document mutator and check each fails on phase while the
/// serialized document stays as it was.
async fn assert_document_mutators_rejected(uvm: &mut UtilityVm, phase: &str) {
    let ctx = OpContext::background();
    let before = uvm.serialized_document().unwrap();

    let results: Vec<(&str, UvmResult<()>)> = vec![
        ("set_memory_limit", uvm.set_memory_limit(&ctx, 4096).await),
        (
            "set_memory_config",
            uvm.set_memory_config(
                &ctx,
                &MemoryConfig {
                    backing_type: MemoryBackingType::Physical,
                    ..Default::default()
                },
            )
            .await,
        ),
        ("set_mmio_config", uvm.set_mmio_config(&ctx, 128, 2048, 512).await),
        ("set_processor_count", uvm.set_processor_count(&ctx, 3).await),
        ("add_scsi_controller", uvm.add_scsi_controller(&ctx, 1).await),
        ("add_vpmem_controller", uvm.add_vpmem_controller(&ctx, 4, 1 << 20).await),
        ("set_uefi_boot", uvm.set_uefi_boot(&ctx, "", "kernel", "").await),
        (
            "set_linux_kernel_direct_boot",
            uvm.set_linux_kernel_direct_boot(&ctx, "kernel", "initrd.img", "")
                .await,
        ),
        ("set_com_port", uvm.set_com_port(&ctx, 1, "pipe").await),
        (
            "apply_schema_options",
            uvm.apply_schema_options(vec![options::with_processor_config(7)]),
        ),
        (
            "set_additional_json",
            uvm.set_additional_json(r#"{"VirtualMachine": {"StopOnReset": false}}"#),
        ),
    ];

    for (name, result) in results {
        assert!(
            matches!(&result, Err(e) if e.is_invalid_state()),
            "{name} while {phase}: {result:?}"
        );
    }
    assert_eq!(
        uvm.serialized_document().unwrap(),
        before,
        "document changed while {phase}"
    );
}

#[tokio::test]
async fn test_document_mutators_after_create_leave_document_unchanged() {
    let h = Harness::without_log_forwarding();
    let ctx = OpContext::background();
    let mut uvm = created(&h, "uvm-frozen").await;
    assert_document_mutators_rejected(&mut uvm, "created").await;

    uvm.start(&ctx).await.unwrap();
    assert_document_mutators_rejected(&mut uvm, "running").await;

    uvm.stop(&ctx).await.unwrap();
    assert_eq!(uvm.state(), State::Terminated);
    assert_document_mutators_rejected(&mut uvm, "terminated").await;

    let before = uvm.serialized_document().unwrap();
    let err = uvm
        .add_vpmem_device(&ctx, 1, "layer.vhd", true, VpMemImageFormat::VHD1)
        .await
        .unwrap_err();
    assert!(err.is_invalid_state());
    let err = uvm
        .add_nic(&ctx, Uuid::new_v4(), "endpoint", "00-15-5D-00-00-03")
        .await
        .unwrap_err();
    assert!(err.is_invalid_state());
    let err = uvm
        .add_scsi_disk(&ctx, 0, 0, "disk.vhdx", ScsiDiskType::VIRTUAL_DISK, false)
        .await
        .unwrap_err();
    assert!(err.is_invalid_state());
    assert_eq!(uvm.serialized_document().unwrap(), before);
    assert_eq!(h.compute.count(HcsOp::Modify), 0);
}

#[tokio::test]
async fn test_terminated_vm_rejects_device_changes() {
    let h = Harness::without_log_forwarding();
    let ctx = OpContext::background();
    let mut uvm = created(&h, "uvm-dead").await;
    uvm.start(&ctx).await.unwrap();
    uvm.stop(&ctx).await.unwrap();

    let err = uvm
        .add_vpmem_device(&ctx, 1, "layer.vhd", true, VpMemImageFormat(42))
        .await
        .unwrap_err();
    assert!(err.is_invalid_state());
    let err = uvm
        .add_nic(&ctx, Uuid::new_v4(), "endpoint", "mac")
        .await
        .unwrap_err();
    assert!(err.is_invalid_state());
    let err = uvm
        .add_scsi_disk(&ctx, 0, 0, "disk.vhdx", ScsiDiskType::VIRTUAL_DISK, false)
        .await
        .unwrap_err();
    assert!(err.is_invalid_state());
    let err = uvm
        .hvsocket_listen(&ctx, ServiceId::from_port(5000))
        .await
        .unwrap_err();
    assert!(err.is_invalid_state());
    assert_eq!(h.compute.count(HcsOp::Modify), 0);
}

#[tokio::test]
async fn test_hvsocket_listen_uses_runtime_id() {
    let h = Harness::without_log_forwarding();
    let ctx = OpContext::background();
    let mut uvm = h.source.new_utility_vm("uvm-listen", "tests");

    let err = uvm
        .hvsocket_listen(&ctx, ServiceId::from_port(5000))
        .await
        .unwrap_err();
    assert!(err.is_invalid_state());

    uvm.create(&ctx).await.unwrap();
    let listener: Box<dyn HvSocketListener> = uvm
        .hvsocket_listen(&ctx, ServiceId::from_port(5000))
        .await
        .unwrap();
    let addr = listener.addr();
    assert_eq!(Some(addr.vm_id), uvm.runtime_id());
    assert!(h.hvsock.is_listening(&addr));

    drop(listener);
    assert!(!h.hvsock.is_listening(&addr));
}

#[tokio::test]
async fn test_kernel_direct_requires_recent_host() {
    let source = LinuxSource::new(
        Arc::new(EmulatedComputeService::new()),
        Arc::new(LoopbackHvSocket::new()),
        Arc::new(NoopSink),
        SourceOptions {
            host_build: Some(17763),
            ..Default::default()
        },
    );
    let ctx = OpContext::background();

    let mut old = source.new_utility_vm("uvm-old-host", "tests");
    let err = old
        .set_linux_kernel_direct_boot(&ctx, "kernel", "initrd.img", "")
        .await
        .unwrap_err();
    assert!(matches!(err, UvmError::Unsupported(_)));

    let h = Harness::new();
    let mut uvm = h.source.new_utility_vm("uvm-new-host", "tests");
    uvm.set_linux_kernel_direct_boot(&ctx, "kernel", "initrd.img", "quiet")
        .await
        .unwrap();
    let doc = uvm.serialized_document().unwrap();
    let direct = &doc["VirtualMachine"]["Chipset"]["LinuxKernelDirect"];
    assert_eq!(direct["KernelFilePath"], "kernel");
    assert_eq!(direct["InitRdPath"], "initrd.img");
    assert_eq!(direct["KernelCmdLine"], "quiet");
}

#[tokio::test]
async fn test_additional_json_is_merged_at_create() {
    let h = Harness::without_log_forwarding();
    let ctx = OpContext::background();
    let mut uvm = h.source.new_utility_vm("uvm-extra", "tests");

    let err = uvm.set_additional_json("{not json").unwrap_err();
    assert!(matches!(err, UvmError::Config(_)));
    assert!(uvm.set_additional_json("[1, 2]").is_err());

    uvm.set_additional_json(r#"{"VirtualMachine": {"StopOnReset": false, "Devices": {"Keyboard": {}}}}"#)
        .unwrap();
    uvm.create(&ctx).await.unwrap();

    let doc = h.compute.document("uvm-extra").unwrap();
    assert_eq!(doc["VirtualMachine"]["StopOnReset"], false);
    assert_eq!(doc["VirtualMachine"]["Devices"]["Keyboard"], serde_json::json!({}));
    assert_eq!(doc["Owner"], "tests");
}

#[tokio::test]
async fn test_empty_additional_json_leaves_document_unchanged() {
    let h = Harness::without_log_forwarding();
    let ctx = OpContext::background();
    let mut uvm = h.source.new_utility_vm("uvm-empty-extra", "tests");
    let plain = uvm.serialized_document().unwrap();

    uvm.set_additional_json("").unwrap();
    assert!(uvm.additional_json().is_none());
    assert_eq!(uvm.serialized_document().unwrap(), plain);

    uvm.set_additional_json("{}").unwrap();
    assert_eq!(uvm.serialized_document().unwrap(), plain);

    uvm.set_additional_json(r#"{"VirtualMachine": {"StopOnReset": false}}"#)
        .unwrap();
    assert_ne!(uvm.serialized_document().unwrap(), plain);
    uvm.set_additional_json("  ").unwrap();
    assert!(uvm.additional_json().is_none());
    assert_eq!(uvm.serialized_document().unwrap(), plain);

    uvm.create(&ctx).await.unwrap();
    assert_eq!(h.compute.document("uvm-empty-extra").unwrap(), plain);
}

#[tokio::test]
async fn test_capabilities_through_trait_object() {
    let h = Harness::new();
    let mut uvm = h.source.new_utility_vm("uvm-caps", "tests");
    let uvm: &mut dyn Uvm = &mut uvm;

    assert_eq!(uvm.capabilities(), Capabilities::all());
    assert_eq!(uvm.state(), State::PreCreated);

    let ctx = OpContext::background();
    uvm.as_processor()
        .unwrap()
        .set_processor_count(&ctx, 2)
        .await
        .unwrap();
    uvm.as_scsi()
        .unwrap()
        .add_scsi_controller(&ctx, 0)
        .await
        .unwrap();
    assert!(uvm.as_network().is_some());
}
