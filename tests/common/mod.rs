#![allow(dead_code, missing_docs)]

use rsched::{
    config::{Config, NetworkOptions},
    error::ResourceError,
    network::Network,
    node::{BackwardApi, ForwardApi, Kernel, NodeSpec},
    pool::Buffer,
    types::{BufferDescriptor, Device, FrameRange, MinibatchLayout, NodeId, Shape},
};
use std::sync::{Arc, Mutex};

pub struct TestConfig;

impl Config for TestConfig {
    type Kernel = TestKernel;
    type Buffer = VecBuffer;
}

/// Frame-major storage: element `i` of frame `f` lives at `f * sample_len + i`.
#[derive(Debug, Clone, PartialEq)]
pub struct VecBuffer {
    descriptor: BufferDescriptor,
    pub data: Vec<f64>,
}

impl VecBuffer {
    pub fn from_data(descriptor: BufferDescriptor, data: Vec<f64>) -> Self {
        assert_eq!(descriptor.shape.len(), data.len());
        Self { descriptor, data }
    }

    fn sample_len(&self) -> usize {
        self.descriptor.shape.sample_len
    }

    /// A single-frame buffer broadcasts over every frame.
    fn column(&self, frame: usize) -> usize {
        if self.descriptor.shape.num_frames == 1 {
            0
        } else {
            frame
        }
    }

    pub fn at(&self, frame: usize, i: usize) -> f64 {
        self.data[self.column(frame) * self.sample_len() + i]
    }

    pub fn set(&mut self, frame: usize, i: usize, value: f64) {
        let index = self.column(frame) * self.sample_len() + i;
        self.data[index] = value;
    }

    pub fn add(&mut self, frame: usize, i: usize, value: f64) {
        let index = self.column(frame) * self.sample_len() + i;
        self.data[index] += value;
    }
}

impl Buffer for VecBuffer {
    fn allocate(descriptor: &BufferDescriptor) -> Result<Self, ResourceError> {
        if let Device::Accelerator(ordinal) = descriptor.device {
            return Err(ResourceError::Allocation {
                descriptor: *descriptor,
                reason: format!("no accelerator {ordinal} in tests"),
            });
        }
        Ok(Self {
            descriptor: *descriptor,
            data: vec![f64::NAN; descriptor.shape.len()],
        })
    }

    fn descriptor(&self) -> &BufferDescriptor {
        &self.descriptor
    }

    fn fill(&mut self, value: f64) {
        self.data.fill(value);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    /// Data leaf; values are injected.
    Input,
    /// Learnable leaf; values are injected.
    Param,
    /// Element-wise sum of all inputs.
    Plus,
    /// First input times a constant.
    Scale(f64),
    /// First input `d` time steps away; zero outside the sequence.
    Delay(isize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Forward(String, FrameRange),
    Backward(String, usize, FrameRange),
}

pub type Log = Arc<Mutex<Vec<Event>>>;

#[derive(Debug, Clone)]
pub struct TestKernel {
    label: String,
    op: Op,
    log: Log,
}

fn split(frame: usize, layout: MinibatchLayout) -> (usize, usize) {
    (
        frame / layout.num_parallel_sequences,
        frame % layout.num_parallel_sequences,
    )
}

fn shifted(frame: usize, offset: isize, layout: MinibatchLayout) -> Option<usize> {
    let (t, s) = split(frame, layout);
    let source = isize::try_from(t).unwrap() - offset;
    let source = usize::try_from(source).ok()?;
    (source < layout.num_time_steps).then_some(source * layout.num_parallel_sequences + s)
}

impl Kernel<TestConfig> for TestKernel {
    fn operation(&self) -> &str {
        match self.op {
            Op::Input => "Input",
            Op::Param => "Param",
            Op::Plus => "Plus",
            Op::Scale(_) => "Scale",
            Op::Delay(_) => "Delay",
        }
    }

    fn time_offset(&self) -> isize {
        match self.op {
            Op::Delay(offset) => offset,
            _ => 0,
        }
    }

    fn forward(&mut self, api: &mut impl ForwardApi<TestConfig>, frame: FrameRange) {
        self.log
            .lock()
            .unwrap()
            .push(Event::Forward(self.label.clone(), frame));
        let layout = api.layout();
        let sample_len = api.output().descriptor().shape.sample_len;
        let mut results = Vec::new();
        for f in frame.frames(layout) {
            for i in 0..sample_len {
                let value = match self.op {
                    Op::Input | Op::Param => continue,
                    Op::Plus => (0..api.num_inputs()).map(|k| api.input(k).at(f, i)).sum::<f64>(),
                    Op::Scale(factor) => factor * api.input(0).at(f, i),
                    Op::Delay(offset) => {
                        shifted(f, offset, layout).map_or(0.0, |source| api.input(0).at(source, i))
                    }
                };
                results.push((f, i, value));
            }
        }
        let output = api.output();
        for (f, i, value) in results {
            output.set(f, i, value);
        }
    }

    fn backward(
        &mut self,
        input_index: usize,
        api: &mut impl BackwardApi<TestConfig>,
        frame: FrameRange,
    ) {
        self.log
            .lock()
            .unwrap()
            .push(Event::Backward(self.label.clone(), input_index, frame));
        let layout = api.layout();
        let sample_len = api.gradient().descriptor().shape.sample_len;
        let mut updates = Vec::new();
        for f in frame.frames(layout) {
            for i in 0..sample_len {
                let gradient = api.gradient().at(f, i);
                match self.op {
                    Op::Input | Op::Param => {}
                    Op::Plus => updates.push((f, i, gradient)),
                    Op::Scale(factor) => updates.push((f, i, factor * gradient)),
                    Op::Delay(offset) => {
                        if let Some(source) = shifted(f, offset, layout) {
                            updates.push((source, i, gradient));
                        }
                    }
                }
            }
        }
        let input_gradient = api.input_gradient();
        for (f, i, value) in updates {
            input_gradient.add(f, i, value);
        }
    }
}

/// Builds nodes whose kernels all record into one log.
#[derive(Debug, Clone, Default)]
pub struct Harness {
    log: Log,
}

impl Harness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spec(&self, name: &str, op: Op, inputs: &[NodeId]) -> NodeSpec<TestConfig> {
        let kernel = TestKernel {
            label: name.to_owned(),
            op,
            log: self.log.clone(),
        };
        NodeSpec::new(name, kernel).inputs(inputs)
    }

    pub fn add(
        &self,
        net: &mut Network<TestConfig>,
        name: &str,
        op: Op,
        inputs: &[NodeId],
    ) -> NodeId {
        let mut spec = self.spec(name, op, inputs);
        if op == Op::Param {
            spec = spec.learnable();
        }
        net.add_node(spec).unwrap()
    }

    pub fn events(&self) -> Vec<Event> {
        self.log.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.log.lock().unwrap().clear();
    }

    /// Frames `name` was computed on, in call order.
    pub fn forwards_of(&self, name: &str) -> Vec<FrameRange> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Forward(label, frame) if label == name => Some(frame),
                _ => None,
            })
            .collect()
    }

    /// Frames `name` back-propagated on, in call order.
    pub fn backwards_of(&self, name: &str) -> Vec<(usize, FrameRange)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Backward(label, input, frame) if label == name => Some((input, frame)),
                _ => None,
            })
            .collect()
    }

    /// Labels of every forward call, in order.
    pub fn forward_labels(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Forward(label, _) => Some(label),
                Event::Backward(..) => None,
            })
            .collect()
    }
}

pub fn network() -> Network<TestConfig> {
    Network::new(NetworkOptions::default())
}

pub fn network_without_sharing() -> Network<TestConfig> {
    Network::new(NetworkOptions {
        share_buffers: false,
        ..NetworkOptions::default()
    })
}

/// Replace the value of a leaf with `data`, one frame per `sample_len`
/// elements.
pub fn feed(net: &mut Network<TestConfig>, id: NodeId, data: &[f64]) {
    let node = net.node(id).unwrap();
    let sample_len = node.sample_len();
    let descriptor = BufferDescriptor {
        shape: Shape {
            sample_len,
            num_frames: data.len() / sample_len,
        },
        device: node.device(),
    };
    net.set_input_value(id, VecBuffer::from_data(descriptor, data.to_vec()))
        .unwrap();
}

pub fn values(net: &Network<TestConfig>, id: NodeId) -> Option<Vec<f64>> {
    net.value(id).map(|buffer| buffer.data.clone())
}

pub fn gradient(net: &Network<TestConfig>, id: NodeId) -> Option<Vec<f64>> {
    net.gradient(id).map(|buffer| buffer.data.clone())
}

pub fn steps(num_steps: usize) -> Vec<FrameRange> {
    (0..num_steps).map(FrameRange::TimeStep).collect()
}

/// Run `f` with its warnings captured as plain text.
pub fn capture_warnings<T>(f: impl FnOnce() -> T) -> (T, String) {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let writer = Arc::clone(&buffer);
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_ansi(false)
        .with_writer(move || SharedWriter(Arc::clone(&writer)))
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    let text = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
    (result, text)
}

struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedWriter {
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
