use anyhow::{anyhow, Result};

use crate::ops::{BinaryOp, ElementwiseParams, PackParams, MAX_RANK};
use crate::runtime::DispatchCommand;
use crate::tensor::{compute_strides, DType};

use super::HostDevice;

/// Register host versions of the kernels dispatched by `crate::ops`.
pub fn register_reference_kernels(device: &HostDevice) -> Result<()> {
    for dtype in DType::all() {
        device.register_kernel(format!("nchw_to_buffer_{}", dtype), nchw_to_buffer)?;
        device.register_kernel(format!("buffer_to_nchw_{}", dtype), buffer_to_nchw)?;
    }
    for op in BinaryOp::all() {
        for dtype in [DType::F32, DType::I32] {
            let op = *op;
            device.register_kernel(
                op.shader_name(dtype),
                move |slots: &mut [Vec<u8>], _: &DispatchCommand| binary(op, dtype, slots),
            )?;
        }
    }
    Ok(())
}

fn expect_slots(slots: &[Vec<u8>], count: usize) -> Result<()> {
    if slots.len() != count {
        return Err(anyhow!("expected {} bound slots, got {}", count, slots.len()));
    }
    Ok(())
}

/// Slots: packed tensor (write), contiguous staging (read), params.
fn nchw_to_buffer(slots: &mut [Vec<u8>], _: &DispatchCommand) -> Result<()> {
    expect_slots(slots, 3)?;
    let params = PackParams::from_bytes(&slots[2])?;
    let (packed, rest) = slots.split_at_mut(1);
    repack(&params, &rest[0], &mut packed[0], true)
}

/// Slots: contiguous staging (write), packed tensor (read), params.
fn buffer_to_nchw(slots: &mut [Vec<u8>], _: &DispatchCommand) -> Result<()> {
    expect_slots(slots, 3)?;
    let params = PackParams::from_bytes(&slots[2])?;
    let (staging, rest) = slots.split_at_mut(1);
    repack(&params, &rest[0], &mut staging[0], false)
}

fn repack(params: &PackParams, src: &[u8], dst: &mut [u8], to_gpu: bool) -> Result<()> {
    if params.rank as usize > MAX_RANK {
        return Err(anyhow!("repack of rank {} exceeds {}", params.rank, MAX_RANK));
    }
    let sizes = params.logical_sizes();
    let gpu_sizes = params.padded_sizes();
    let gpu_strides = compute_strides(&gpu_sizes);
    let logical_strides = compute_strides(&sizes);
    let elem = params.element_size as usize;
    for linear in 0..params.numel as usize {
        let mut rem = linear;
        let mut gpu_index = 0usize;
        for (stride, gpu_stride) in logical_strides.iter().zip(gpu_strides.iter()) {
            let stride = (*stride).max(1);
            gpu_index += (rem / stride) * gpu_stride;
            rem %= stride;
        }
        let (src_index, dst_index) = if to_gpu {
            (linear, gpu_index)
        } else {
            (gpu_index, linear)
        };
        let from = src
            .get(src_index * elem..(src_index + 1) * elem)
            .ok_or_else(|| anyhow!("repack read of element {} out of range", src_index))?;
        dst.get_mut(dst_index * elem..(dst_index + 1) * elem)
            .ok_or_else(|| anyhow!("repack write of element {} out of range", dst_index))?
            .copy_from_slice(from);
    }
    Ok(())
}

/// Slots: lhs (read), rhs (read), out (write), params.
fn binary(op: BinaryOp, dtype: DType, slots: &mut [Vec<u8>]) -> Result<()> {
    expect_slots(slots, 4)?;
    let params = ElementwiseParams::from_bytes(&slots[3])?;
    let elem = dtype.element_size();
    let nbytes = params.numel as usize * elem;
    if slots[..3].iter().any(|slot| slot.len() < nbytes) {
        return Err(anyhow!(
            "binary_{} operands shorter than {} bytes",
            op.as_str(),
            nbytes
        ));
    }
    let (inputs, out) = slots.split_at_mut(2);
    let out = &mut out[0];
    for i in 0..params.numel as usize {
        let range = i * elem..(i + 1) * elem;
        let mut lhs = [0u8; 4];
        let mut rhs = [0u8; 4];
        lhs.copy_from_slice(&inputs[0][range.clone()]);
        rhs.copy_from_slice(&inputs[1][range.clone()]);
        let result = match dtype {
            DType::F32 => op
                .apply_f32(f32::from_le_bytes(lhs), f32::from_le_bytes(rhs))
                .to_le_bytes(),
            DType::I32 => op
                .apply_i32(i32::from_le_bytes(lhs), i32::from_le_bytes(rhs))
                .to_le_bytes(),
            _ => return Err(anyhow!("binary kernels do not support {}", dtype)),
        };
        out[range].copy_from_slice(&result);
    }
    Ok(())
}
