//! # domain
//!
//! Defines the `OpenClDevice` struct that runs a generated [`KernelProgram`] on one OpenCL device.
//!
//! The device keeps one kernel object per entry point and current buffer, so flipping buffers is a
//! choice of kernel rather than an argument rewrite.

use ocl::{Buffer, Context, Device, Kernel, Platform, Program, Queue};
use ocl_macros::*;

use crate::lbm::codegen::KernelProgram;
use crate::lbm::device::ComputeDevice;
use crate::lbm::{self, LbmError, Result};

struct Kernels {
    collide_and_stream: [Kernel; 2],
    collect_moments: [Kernel; 2],
}

/// OpenCL buffers, queue and compiled kernels for one lattice.
pub struct OpenClDevice {
    device: Device,
    context: Context,
    queue: Queue,

    n: usize,
    q: usize,
    f: Option<[Buffer<f32>; 2]>,
    material: Option<Buffer<i32>>,
    moments: Option<Buffer<f32>>,

    kernels: Option<Kernels>,
}

impl OpenClDevice {
    /// `device` must belong to `platform`, the context is built on that platform.
    pub fn new(platform: Platform, device: Device) -> Result<OpenClDevice> {
        let context = Context::builder().platform(platform).devices(device).build()?;
        let queue = Queue::new(&context, device, None)?;
        Ok(OpenClDevice {
            device,
            context,
            queue,
            n: 0,
            q: 0,
            f: None,
            material: None,
            moments: None,
            kernels: None,
        })
    }

    fn populations(&self) -> Result<&[Buffer<f32>; 2]> {
        self.f
            .as_ref()
            .ok_or_else(|| LbmError::Device("population buffers are not allocated".to_owned()))
    }

    fn kernels(&self) -> Result<&Kernels> {
        self.kernels
            .as_ref()
            .ok_or_else(|| LbmError::Device("no program loaded".to_owned()))
    }

    fn check_len(buffer: &'static str, expected: usize, found: usize) -> Result<()> {
        if expected != found {
            return Err(LbmError::BufferSizeMismatch {
                buffer,
                expected,
                found,
            });
        }
        Ok(())
    }
}

impl ComputeDevice for OpenClDevice {
    fn name(&self) -> String {
        self.device.name().unwrap_or_else(|_| "unknown OpenCL device".to_owned())
    }

    fn allocate(&mut self, q: usize, dimensions: usize, cells: usize) -> Result<()> {
        let queue = &self.queue;
        self.n = cells;
        self.q = q;
        self.f = Some([buffer!(queue, [q * cells], 0f32), buffer!(queue, [q * cells], 0f32)]);
        self.material = Some(buffer!(queue, [cells], 0i32));
        self.moments = Some(buffer!(queue, [(dimensions + 1) * cells], 0f32));
        self.kernels = None;
        Ok(())
    }

    fn load_program(&mut self, program: &KernelProgram) -> Result<()> {
        let source = program.opencl_source()?;
        log::info!("Compiling OpenCL program ({} bytes)", source.len());
        let ocl_program = Program::builder()
            .devices(self.device)
            .src(&source)
            .build(&self.context)
            .map_err(|e| LbmError::KernelCompilation(e.to_string()))?;

        let queue = self.queue.clone();
        let n = self.n;
        let f = self.populations()?;
        let material = self
            .material
            .as_ref()
            .ok_or_else(|| LbmError::Device("material buffer is not allocated".to_owned()))?;
        let moments = self
            .moments
            .as_ref()
            .ok_or_else(|| LbmError::Device("moments buffer is not allocated".to_owned()))?;

        let collide = |current: lbm::Buffer| -> Result<Kernel> {
            let (prev, next) = (&f[current as usize], &f[current.other() as usize]);
            let mut builder = kernel_builder!(ocl_program, queue, "collide_and_stream", [n]);
            kernel_args!(builder, ("f_next", next), ("f_prev", prev), ("material", material), ("time", 0u32));
            Ok(builder.build()?)
        };
        let collect = |current: lbm::Buffer| -> Result<Kernel> {
            let mut builder = kernel_builder!(ocl_program, queue, "collect_moments", [n]);
            kernel_args!(builder, ("f", &f[current as usize]), ("moments", moments));
            Ok(builder.build()?)
        };
        let kernels = Kernels {
            collide_and_stream: [collide(lbm::Buffer::A)?, collide(lbm::Buffer::B)?],
            collect_moments: [collect(lbm::Buffer::A)?, collect(lbm::Buffer::B)?],
        };
        self.kernels = Some(kernels);
        Ok(())
    }

    fn write_material(&mut self, tags: &[i32]) -> Result<()> {
        OpenClDevice::check_len("material", self.n, tags.len())?;
        let material = self
            .material
            .as_ref()
            .ok_or_else(|| LbmError::Device("material buffer is not allocated".to_owned()))?;
        material.write(tags).enq()?;
        Ok(())
    }

    fn write_populations(&mut self, target: lbm::Buffer, data: &[f32]) -> Result<()> {
        OpenClDevice::check_len("populations", self.n * self.q, data.len())?;
        self.populations()?[target as usize].write(data).enq()?;
        Ok(())
    }

    fn enqueue_collide_and_stream(&mut self, current: lbm::Buffer, time: u32) -> Result<()> {
        let kernel = &self.kernels()?.collide_and_stream[current as usize];
        kernel.set_arg("time", time)?;
        unsafe { kernel.cmd().enq()? }
        Ok(())
    }

    fn enqueue_collect_moments(&mut self, current: lbm::Buffer) -> Result<()> {
        let kernel = &self.kernels()?.collect_moments[current as usize];
        unsafe { kernel.cmd().enq()? }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.queue.finish()?;
        Ok(())
    }

    fn read_populations(&mut self, source: lbm::Buffer, out: &mut [f32]) -> Result<()> {
        OpenClDevice::check_len("populations", self.n * self.q, out.len())?;
        self.populations()?[source as usize].read(out).enq()?;
        Ok(())
    }

    fn read_moments(&mut self, out: &mut [f32]) -> Result<()> {
        let moments = self
            .moments
            .as_ref()
            .ok_or_else(|| LbmError::Device("moments buffer is not allocated".to_owned()))?;
        OpenClDevice::check_len("moments", moments.len(), out.len())?;
        moments.read(out).enq()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lbm::geometry::{MaterialMap, Region};
    use crate::lbm::{material, Lattice, LatticeConfig};
    use approx::assert_relative_eq;

    #[test]
    fn every_listed_device_gets_a_context() {
        let devices = match crate::opencl::get_devices() {
            Ok(devices) => devices,
            Err(_) => return, // no OpenCL platform
        };
        for (platform, device) in devices {
            let mut opencl = OpenClDevice::new(platform, device).unwrap();
            opencl.allocate(9, 2, 64).unwrap();
            opencl.finish().unwrap();
        }
    }

    #[test]
    fn opencl_matches_host() {
        let (platform, device) = match crate::opencl::device_selection() {
            Ok(selected) => selected,
            Err(_) => return, // no OpenCL platform
        };
        let config = LatticeConfig::new();
        let grid = config.grid();
        let map = MaterialMap::enclosure(grid, 2).with(
            Region::Sphere { center: [16.0, 16.0, 0.0], radius: 4.0 },
            material::OBSTACLE,
        );

        let mut host = Lattice::new(config.clone()).unwrap();
        let mut gpu = Lattice::with_device(config, OpenClDevice::new(platform, device).unwrap()).unwrap();
        for lattice in [&mut host, &mut gpu] {
            lattice.apply_material_map(&map).unwrap();
            lattice.equilibrate(1.0, [0.02, 0.0, 0.0]).unwrap();
            lattice.run(50).unwrap();
            lattice.collect_moments().unwrap();
            lattice.sync().unwrap();
        }
        let (a, b) = (host.moments().unwrap(), gpu.moments().unwrap());
        for (x, y) in a.as_slice().iter().zip(b.as_slice()) {
            assert_relative_eq!(*x, *y, epsilon = 1e-4);
        }
    }
}
